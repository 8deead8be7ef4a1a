pub mod scope;
pub mod story;
