#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

pub mod collection;
pub mod null;
pub mod pipeline;
pub mod region;
pub mod reliable;
pub mod seq;
pub mod simulator;
pub mod stage;
pub mod unreliable;

pub use octs;
