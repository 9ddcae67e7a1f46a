//! Protocol module

#![allow(missing_docs)]

pub mod compact_pack;
pub mod companion;
pub mod crypto;
pub mod datastream;
pub mod hap;
pub mod mrp;
pub mod pairing;
pub mod rtsp;
