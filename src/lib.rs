//! Wakes libvirt domains when a Wake-on-LAN magic packet for one of their MACs is seen.
//!
//! Magic packets arrive over UDP (`layer4`) or as raw EtherType 0x0842 frames
//! (`layer2`). Both listeners feed a bounded queue drained by the
//! [`dispatch::Dispatcher`], which looks the MAC up in the periodically rebuilt
//! [`index::TargetIndex`] and asks the external controller to start the target.

pub mod allowlist;
pub mod common;
pub mod config;
pub mod controller;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod index;
pub mod layer2;
pub mod layer4;

pub use error::{Error, Result};
pub use event::WolEvent;
