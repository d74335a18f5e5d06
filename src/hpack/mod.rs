//! Header compression shared between HPACK (RFC 7541) and QPACK (RFC 9204).
//!
//! Huffman coding, prefix integers and the dynamic table are identical in
//! both schemes and live here; the HPACK static table and codec sit next to
//! them, QPACK builds on top in `h3::qpack`.

pub mod codec;
pub mod dynamic_table;
pub mod huffman;
pub mod integer;
pub mod static_table;

pub use codec::{HpackDecoder, HpackEncoder};
pub use dynamic_table::{DynamicTable, Entry, ENTRY_OVERHEAD};
