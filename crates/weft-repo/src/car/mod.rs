//! CAR (Content Addressable aRchive) I/O
//!
//! The format all multi-block outputs use: a varint-prefixed CBOR header
//! `{roots: [CID], version: 1}` followed by a sequence of
//! `(varint length, CID, bytes)` blocks.

pub mod reader;
pub mod writer;

pub use reader::{ParsedCar, parse_car_bytes, read_car};
pub use writer::{export_repo_car, export_repo_car_bytes, write_car, write_car_bytes};
