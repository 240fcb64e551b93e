pub mod space_bitmap;

pub use space_bitmap::SpaceBitmap;
