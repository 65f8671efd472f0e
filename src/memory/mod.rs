pub mod address;
pub mod bitmap_frame_allocator;
pub mod heap;
pub mod paging;
pub mod phys;
