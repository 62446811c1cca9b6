/*!
Typed configuration lookups.

The core never parses configuration files. It reads values through the
[`Conf`] collaborator, which hands back typed values by key. A missing key is
`Ok(None)` so callers keep whatever default they already hold; a present but
unreadable value is an [`Error::Malformed`](crate::Error::Malformed).
*/

mod conf;
mod range;

pub use conf::{Conf, ConfMap};
pub use range::Range;
