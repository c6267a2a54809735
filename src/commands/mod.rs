pub mod import;
pub mod normalize;
pub mod reembed;
pub mod status;
