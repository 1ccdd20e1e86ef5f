#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use vc_evloop as evloop;
pub use vc_pool as pool;
