pub mod analysis;
pub mod document;
pub mod event;
pub mod extraction;
