#![doc = include_str!("../README.md")]
#![deny(unsafe_code, missing_docs)]

pub mod address;
pub mod buffer;
pub mod cert;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod inet;
pub mod multicast;
pub mod network;
pub mod packet;
pub mod peer;
pub mod pow;
pub mod runtime;
pub mod topology;
pub mod world;
