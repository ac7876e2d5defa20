pub mod allocator;
pub mod edge;
pub mod kelly;
pub mod normalize;
