//! Fixed-capacity pool of output images.
//!
//! Renderers allocate their output frames here so steady-state capture does
//! not touch the allocator. A frame handed out by [`FramePool::acquire`]
//! returns to the pool when the last owner drops it, which may be a writer
//! thread long after the renderer moved on.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::frame::{FormatDescription, ImageBuffer};

/// Extra buffers allocated beyond the consumer's retained-buffer hint.
pub const OUTPUT_POOL_MARGIN: usize = 2;

struct PoolShared {
    format: FormatDescription,
    free: Mutex<Vec<ImageBuffer>>,
    outstanding: AtomicUsize,
}

impl PoolShared {
    fn release(&self, mut image: ImageBuffer) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if image.format != self.format {
            return;
        }
        image.timestamp = Default::default();
        self.free.lock().push(image);
    }
}

/// A pool of identically formatted images, preallocated up front.
pub struct FramePool {
    shared: Arc<PoolShared>,
    capacity: usize,
}

impl FramePool {
    /// Preallocate `retained_hint + OUTPUT_POOL_MARGIN` images of `format`.
    pub fn new(format: FormatDescription, retained_hint: usize) -> Self {
        let capacity = retained_hint + OUTPUT_POOL_MARGIN;
        let free = (0..capacity).map(|_| ImageBuffer::new(format)).collect();
        Self {
            shared: Arc::new(PoolShared {
                format,
                free: Mutex::new(free),
                outstanding: AtomicUsize::new(0),
            }),
            capacity,
        }
    }

    pub fn format(&self) -> FormatDescription {
        self.shared.format
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Images currently owned outside the pool.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Take a free image, or `None` if every buffer is in flight.
    pub fn acquire(&self) -> Option<PooledFrame> {
        let image = self.shared.free.lock().pop()?;
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        Some(PooledFrame {
            image: Some(image),
            home: Arc::downgrade(&self.shared),
        })
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("format", &self.shared.format)
            .field("capacity", &self.capacity)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// An image borrowed from a [`FramePool`]. Returns home on drop.
///
/// If the pool was reset in the meantime the image is simply freed.
pub struct PooledFrame {
    image: Option<ImageBuffer>,
    home: Weak<PoolShared>,
}

impl PooledFrame {
    /// Wrap an image that does not belong to any pool.
    pub fn detached(image: ImageBuffer) -> Self {
        Self {
            image: Some(image),
            home: Weak::new(),
        }
    }

    /// Take the image out, leaving its pool slot permanently consumed.
    pub fn into_image(mut self) -> ImageBuffer {
        if let Some(home) = self.home.upgrade() {
            home.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
        self.home = Weak::new();
        match self.image.take() {
            Some(image) => image,
            None => unreachable!("pooled frame released twice"),
        }
    }
}

impl Deref for PooledFrame {
    type Target = ImageBuffer;

    fn deref(&self) -> &ImageBuffer {
        // Only `into_image` and `drop` take the image, and both consume self.
        match &self.image {
            Some(image) => image,
            None => unreachable!("pooled frame accessed after release"),
        }
    }
}

impl DerefMut for PooledFrame {
    fn deref_mut(&mut self) -> &mut ImageBuffer {
        match &mut self.image {
            Some(image) => image,
            None => unreachable!("pooled frame accessed after release"),
        }
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        if let (Some(image), Some(home)) = (self.image.take(), self.home.upgrade()) {
            home.release(image);
        }
    }
}

impl std::fmt::Debug for PooledFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledFrame")
            .field("format", &self.image.as_ref().map(|i| i.format))
            .field("pooled", &(self.home.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn format() -> FormatDescription {
        FormatDescription::new(PixelFormat::Bgra8, 4, 4)
    }

    #[test]
    fn test_capacity_includes_margin() {
        let pool = FramePool::new(format(), 3);
        assert_eq!(pool.capacity(), 3 + OUTPUT_POOL_MARGIN);
    }

    #[test]
    fn test_exhaustion_and_return() {
        let pool = FramePool::new(format(), 0);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.outstanding(), 2);

        drop(a);
        assert_eq!(pool.outstanding(), 1);
        assert!(pool.acquire().is_some());
        drop(b);
    }

    #[test]
    fn test_frame_outlives_pool() {
        let pool = FramePool::new(format(), 0);
        let frame = pool.acquire().unwrap();
        drop(pool);
        assert_eq!(frame.width(), 4);
        drop(frame);
    }

    #[test]
    fn test_into_image_consumes_slot() {
        let pool = FramePool::new(format(), 0);
        let image = pool.acquire().unwrap().into_image();
        assert_eq!(image.format, format());
        assert_eq!(pool.outstanding(), 0);
        let _held = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_detached_frame() {
        let frame = PooledFrame::detached(ImageBuffer::new(format()));
        assert_eq!(frame.data.len(), 64);
    }
}
