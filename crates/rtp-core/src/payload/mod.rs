//! RTP payload formats

pub mod h264;

pub use h264::{H264Depacketizer, H264Packetizer, H264Payload, find_start_code, is_keyframe, packetize};
