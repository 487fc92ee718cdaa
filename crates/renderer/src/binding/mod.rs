//! Binding layouts, binding data and their pooled allocation.

mod data;
mod factory;
mod layout;

pub use data::BindingData;
pub use factory::{BindingDataFactory, FactoryStats};
pub use layout::{BindingDesc, BindingKind, BindingLayout, align_up};
