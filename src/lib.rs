#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod collection;
mod error;
mod exchanger;
mod lifetime;
mod observable;
mod operators;
mod perishable;

pub use collection::*;
pub use error::*;
pub use exchanger::*;
pub use lifetime::*;
pub use observable::*;
pub use operators::*;
pub use perishable::*;
