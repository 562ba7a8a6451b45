// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared pixel store with atomic size, per-client dirty-region tracking,
//! in-place resize, and overlap-safe block copy.
//!
//! The framebuffer is conceptually one writer (the embedder) and many
//! readers (client sessions). Each client session registers a handle —
//! an `Arc<RwLock<Vec<DirtyRegion>>>` — that the framebuffer pushes
//! newly-dirtied rectangles into. There is deliberately no single global
//! dirty region: clients drain updates at different rates, so a shared
//! accumulator would either starve slow clients or never clear.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::sync::RwLock;

use crate::error::{Result, VncError};

/// A rectangular region, used both for dirty-region tracking and for
/// CopyRect destination/source bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRegion {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
}

impl DirtyRegion {
    /// Creates a new region.
    #[must_use]
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self { x, y, width, height }
    }

    /// Returns true if this region covers zero pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Returns the intersection of two regions, or `None` if they don't overlap.
    #[must_use]
    pub fn intersect(&self, other: &DirtyRegion) -> Option<DirtyRegion> {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x as u32 + self.width as u32).min(other.x as u32 + other.width as u32);
        let y2 = (self.y as u32 + self.height as u32).min(other.y as u32 + other.height as u32);

        if x2 <= x1 as u32 || y2 <= y1 as u32 {
            return None;
        }

        Some(DirtyRegion {
            x: x1,
            y: y1,
            width: (x2 - x1 as u32) as u16,
            height: (y2 - y1 as u32) as u16,
        })
    }

    /// Returns true if this region's bounding box overlaps `other`'s.
    #[must_use]
    pub fn overlaps(&self, other: &DirtyRegion) -> bool {
        self.intersect(other).is_some()
    }
}

/// Handle a client session registers with the framebuffer to receive
/// dirty-region push notifications.
pub type DirtyHandle = Arc<RwLock<Vec<DirtyRegion>>>;

/// Shared RGBA32 pixel store.
///
/// Fixed internal format: 32-bit pixels, byte order R,G,B,X, stride =
/// width × 4. Width and height are atomic so concurrent readers observe a
/// consistent size even while a resize is in flight relative to them.
pub struct Framebuffer {
    width: Arc<AtomicU16>,
    height: Arc<AtomicU16>,
    pixels: Arc<RwLock<Vec<u8>>>,
    clients: Arc<RwLock<Vec<DirtyHandle>>>,
}

impl Clone for Framebuffer {
    fn clone(&self) -> Self {
        Self {
            width: self.width.clone(),
            height: self.height.clone(),
            pixels: self.pixels.clone(),
            clients: self.clients.clone(),
        }
    }
}

impl Framebuffer {
    /// Creates a new framebuffer of the given dimensions, initialized to black.
    #[must_use]
    pub fn new(width: u16, height: u16) -> Self {
        let len = stride(width) * height as usize;
        Self {
            width: Arc::new(AtomicU16::new(width)),
            height: Arc::new(AtomicU16::new(height)),
            pixels: Arc::new(RwLock::new(black_buffer(len))),
            clients: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Current width in pixels.
    #[must_use]
    pub fn width(&self) -> u16 {
        self.width.load(Ordering::Acquire)
    }

    /// Current height in pixels.
    #[must_use]
    pub fn height(&self) -> u16 {
        self.height.load(Ordering::Acquire)
    }

    /// Registers a client's dirty-region handle so future `mark_dirty` and
    /// `resize` calls push rectangles into it.
    pub async fn register_client(&self, handle: DirtyHandle) {
        self.clients.write().await.push(handle);
    }

    /// Removes a previously registered client handle (compared by `Arc` pointer identity).
    pub async fn unregister_client(&self, handle: &DirtyHandle) {
        let mut clients = self.clients.write().await;
        clients.retain(|h| !Arc::ptr_eq(h, handle));
    }

    /// Copies a full frame into the backing store and marks the whole
    /// surface dirty for every registered client.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::InvalidOperation`] if `data.len()` does not
    /// equal `stride × height`.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let (w, h) = (self.width(), self.height());
        let expected = stride(w) * h as usize;
        if data.len() != expected {
            return Err(VncError::InvalidOperation(format!(
                "framebuffer write: expected {expected} bytes, got {}",
                data.len()
            )));
        }

        {
            let mut pixels = self.pixels.write().await;
            pixels.copy_from_slice(data);
        } // publication fence: pixels visible before the dirty mark below

        self.mark_dirty(DirtyRegion::new(0, 0, w, h)).await;
        Ok(())
    }

    /// Writes a sub-rectangle of pixels (x, y, width, height) into the
    /// backing store and marks that rectangle dirty. `data` must be
    /// exactly `width * height * 4` bytes of tightly-packed RGBA32.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::InvalidOperation`] if the rectangle is out of
    /// bounds or `data` is the wrong length.
    pub async fn write_rect(&self, data: &[u8], x: u16, y: u16, w: u16, h: u16) -> Result<()> {
        let (fb_w, fb_h) = (self.width(), self.height());
        if x as u32 + w as u32 > fb_w as u32 || y as u32 + h as u32 > fb_h as u32 {
            return Err(VncError::InvalidOperation(
                "framebuffer write_rect: rectangle out of bounds".to_string(),
            ));
        }
        let expected = w as usize * h as usize * 4;
        if data.len() != expected {
            return Err(VncError::InvalidOperation(format!(
                "framebuffer write_rect: expected {expected} bytes, got {}",
                data.len()
            )));
        }

        {
            let mut pixels = self.pixels.write().await;
            let row_bytes = w as usize * 4;
            for row in 0..h as usize {
                let src = &data[row * row_bytes..(row + 1) * row_bytes];
                let dst_offset = ((y as usize + row) * fb_w as usize + x as usize) * 4;
                pixels[dst_offset..dst_offset + row_bytes].copy_from_slice(src);
            }
        }

        self.mark_dirty(DirtyRegion::new(x, y, w, h)).await;
        Ok(())
    }

    /// Reads a rectangle of pixel data out of the framebuffer as RGBA32.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::InvalidOperation`] if the requested rectangle
    /// falls outside the current framebuffer dimensions.
    pub async fn get_rect(&self, x: u16, y: u16, w: u16, h: u16) -> Result<Vec<u8>> {
        let (fb_w, fb_h) = (self.width(), self.height());
        if w == 0 || h == 0 {
            return Ok(Vec::new());
        }
        if x as u32 + w as u32 > fb_w as u32 || y as u32 + h as u32 > fb_h as u32 {
            return Err(VncError::InvalidOperation(format!(
                "get_rect: ({x},{y} {w}x{h}) outside framebuffer {fb_w}x{fb_h}"
            )));
        }

        let pixels = self.pixels.read().await;
        let mut out = Vec::with_capacity(w as usize * h as usize * 4);
        let row_bytes = w as usize * 4;
        for row in 0..h as usize {
            let offset = ((y as usize + row) * fb_w as usize + x as usize) * 4;
            out.extend_from_slice(&pixels[offset..offset + row_bytes]);
        }
        Ok(out)
    }

    /// Unions `rect` into every registered client's dirty accumulator.
    pub async fn mark_dirty(&self, rect: DirtyRegion) {
        if rect.is_empty() {
            return;
        }
        let clients = self.clients.read().await;
        for handle in clients.iter() {
            handle.write().await.push(rect);
        }
    }

    /// Resizes the framebuffer in place: reallocates the buffer, preserves
    /// the top-left `min(old, new)` sub-image, fills the remainder with
    /// black (RGB=0, X=0xFF), marks the full new surface dirty for every
    /// client, and returns the old dimensions so the caller can reset
    /// per-client compression streams (which must happen because the
    /// pixel stream those streams model has just discontinuously changed
    /// shape).
    pub async fn resize(&self, new_w: u16, new_h: u16) -> (u16, u16) {
        let (old_w, old_h) = (self.width(), self.height());
        let new_len = stride(new_w) * new_h as usize;

        let mut new_pixels = black_buffer(new_len);
        {
            let old_pixels = self.pixels.read().await;
            let copy_w = old_w.min(new_w) as usize;
            let copy_h = old_h.min(new_h) as usize;
            let row_bytes = copy_w * 4;
            for row in 0..copy_h {
                let src_offset = row * old_w as usize * 4;
                let dst_offset = row * new_w as usize * 4;
                new_pixels[dst_offset..dst_offset + row_bytes]
                    .copy_from_slice(&old_pixels[src_offset..src_offset + row_bytes]);
            }
        }

        {
            let mut pixels = self.pixels.write().await;
            *pixels = new_pixels;
        }

        self.width.store(new_w, Ordering::Release);
        self.height.store(new_h, Ordering::Release);

        self.mark_dirty(DirtyRegion::new(0, 0, new_w, new_h)).await;

        (old_w, old_h)
    }

    /// Overlap-safe block copy within the framebuffer: copies the `(w, h)`
    /// rectangle at `src` to `dst`. When the source and destination
    /// overlap, traversal direction is chosen so no row is overwritten
    /// before it's read.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::InvalidOperation`] if either rectangle falls
    /// outside the current framebuffer dimensions.
    pub async fn copy_region(&self, src: DirtyRegion, dst_x: u16, dst_y: u16) -> Result<()> {
        let (fb_w, fb_h) = (self.width(), self.height());
        let (w, h) = (src.width, src.height);

        if src.x as u32 + w as u32 > fb_w as u32
            || src.y as u32 + h as u32 > fb_h as u32
            || dst_x as u32 + w as u32 > fb_w as u32
            || dst_y as u32 + h as u32 > fb_h as u32
        {
            return Err(VncError::InvalidOperation(
                "copy_region: rectangle outside framebuffer bounds".to_string(),
            ));
        }

        let mut pixels = self.pixels.write().await;
        let row_bytes = w as usize * 4;
        let stride = fb_w as usize * 4;

        // Choose traversal order to avoid self-corruption on overlap.
        let rows_down = dst_y <= src.y; // safe to copy top-to-bottom
        let cols_right = dst_x <= src.x; // safe to copy left-to-right within a row

        let row_indices: Vec<usize> = if rows_down {
            (0..h as usize).collect()
        } else {
            (0..h as usize).rev().collect()
        };

        for row in row_indices {
            let src_row_off = (src.y as usize + row) * stride + src.x as usize * 4;
            let dst_row_off = (dst_y as usize + row) * stride + dst_x as usize * 4;

            if cols_right || src_row_off >= dst_row_off + row_bytes || dst_row_off >= src_row_off + row_bytes {
                // Non-overlapping rows, or safe left-to-right: plain copy_within works
                // because copy_from_slice requires disjoint borrows; use split logic instead.
                copy_row(&mut pixels, src_row_off, dst_row_off, row_bytes);
            } else {
                // Overlapping within the row and moving right-to-left required.
                copy_row_reverse(&mut pixels, src_row_off, dst_row_off, row_bytes);
            }
        }

        drop(pixels);
        self.mark_dirty(DirtyRegion::new(dst_x, dst_y, w, h)).await;
        Ok(())
    }
}

fn stride(width: u16) -> usize {
    width as usize * 4
}

fn black_buffer(len: usize) -> Vec<u8> {
    // R=0, G=0, B=0, X=0xFF per pixel.
    let mut buf = vec![0u8; len];
    let mut i = 3;
    while i < buf.len() {
        buf[i] = 0xFF;
        i += 4;
    }
    buf
}

/// Copies one row, byte-by-byte in forward order, safe when reading from
/// an earlier offset than (or non-overlapping with) the write.
fn copy_row(buf: &mut [u8], src_off: usize, dst_off: usize, len: usize) {
    if src_off == dst_off {
        return;
    }
    for i in 0..len {
        buf[dst_off + i] = buf[src_off + i];
    }
}

/// Copies one row in reverse byte order, safe when the destination starts
/// after the source within the same row span.
fn copy_row_reverse(buf: &mut [u8], src_off: usize, dst_off: usize, len: usize) {
    for i in (0..len).rev() {
        buf[dst_off + i] = buf[src_off + i];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_framebuffer_is_black() {
        let fb = Framebuffer::new(4, 4);
        let rect = fb.get_rect(0, 0, 4, 4).await.unwrap();
        for chunk in rect.chunks_exact(4) {
            assert_eq!(chunk, &[0, 0, 0, 0xFF]);
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let fb = Framebuffer::new(2, 2);
        let data = vec![
            10, 20, 30, 0, 40, 50, 60, 0,
            70, 80, 90, 0, 100, 110, 120, 0,
        ];
        fb.write(&data).await.unwrap();
        let rect = fb.get_rect(0, 0, 2, 2).await.unwrap();
        assert_eq!(rect, data);
    }

    #[tokio::test]
    async fn write_wrong_length_errors() {
        let fb = Framebuffer::new(2, 2);
        let err = fb.write(&[0u8; 4]).await.unwrap_err();
        assert!(matches!(err, VncError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn mark_dirty_pushes_to_registered_clients() {
        let fb = Framebuffer::new(10, 10);
        let handle: DirtyHandle = Arc::new(RwLock::new(Vec::new()));
        fb.register_client(handle.clone()).await;

        fb.mark_dirty(DirtyRegion::new(1, 2, 3, 4)).await;

        let regions = handle.read().await;
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0], DirtyRegion::new(1, 2, 3, 4));
    }

    #[tokio::test]
    async fn unregister_stops_future_pushes() {
        let fb = Framebuffer::new(10, 10);
        let handle: DirtyHandle = Arc::new(RwLock::new(Vec::new()));
        fb.register_client(handle.clone()).await;
        fb.unregister_client(&handle).await;

        fb.mark_dirty(DirtyRegion::new(0, 0, 1, 1)).await;
        assert!(handle.read().await.is_empty());
    }

    #[tokio::test]
    async fn resize_preserves_top_left_and_blacks_remainder() {
        let fb = Framebuffer::new(2, 2);
        let data = vec![
            10, 20, 30, 0, 40, 50, 60, 0,
            70, 80, 90, 0, 100, 110, 120, 0,
        ];
        fb.write(&data).await.unwrap();

        let (old_w, old_h) = fb.resize(4, 4).await;
        assert_eq!((old_w, old_h), (2, 2));

        let top_left = fb.get_rect(0, 0, 2, 2).await.unwrap();
        assert_eq!(top_left, data);

        let outside = fb.get_rect(2, 0, 2, 2).await.unwrap();
        for chunk in outside.chunks_exact(4) {
            assert_eq!(chunk, &[0, 0, 0, 0xFF]);
        }
    }

    #[tokio::test]
    async fn resize_marks_full_new_surface_dirty() {
        let fb = Framebuffer::new(2, 2);
        let handle: DirtyHandle = Arc::new(RwLock::new(Vec::new()));
        fb.register_client(handle.clone()).await;

        fb.resize(8, 6).await;

        let regions = handle.read().await;
        assert_eq!(regions.last().copied(), Some(DirtyRegion::new(0, 0, 8, 6)));
    }

    #[tokio::test]
    async fn copy_region_overlap_forward_matches_disjoint_copy() {
        // Build a framebuffer with a distinct pattern, do an overlapping
        // shift, and compare against a reference two-buffer copy.
        let fb = Framebuffer::new(8, 1);
        let mut data = Vec::new();
        for i in 0u8..8 {
            data.extend_from_slice(&[i, i, i, 0]);
        }
        fb.write(&data).await.unwrap();

        // Shift row right by 2 pixels: dst starts after src, overlapping.
        fb.copy_region(DirtyRegion::new(0, 0, 6, 1), 2, 0).await.unwrap();

        let result = fb.get_rect(0, 0, 8, 1).await.unwrap();

        // Reference: disjoint two-buffer copy of the same shift.
        let mut expected = data.clone();
        let src_slice = data[0..6 * 4].to_vec();
        expected[2 * 4..8 * 4].copy_from_slice(&src_slice);

        assert_eq!(result, expected);
    }

    #[tokio::test]
    async fn copy_region_overlap_backward_matches_disjoint_copy() {
        let fb = Framebuffer::new(8, 1);
        let mut data = Vec::new();
        for i in 0u8..8 {
            data.extend_from_slice(&[i, i, i, 0]);
        }
        fb.write(&data).await.unwrap();

        // Shift row left by 2 pixels: dst starts before src, overlapping.
        fb.copy_region(DirtyRegion::new(2, 0, 6, 1), 0, 0).await.unwrap();

        let result = fb.get_rect(0, 0, 8, 1).await.unwrap();

        let mut expected = data.clone();
        let src_slice = data[2 * 4..8 * 4].to_vec();
        expected[0..6 * 4].copy_from_slice(&src_slice);

        assert_eq!(result, expected);
    }

    #[test]
    fn intersect_disjoint_regions_is_none() {
        let a = DirtyRegion::new(0, 0, 10, 10);
        let b = DirtyRegion::new(20, 20, 5, 5);
        assert!(a.intersect(&b).is_none());
    }

    #[test]
    fn intersect_overlapping_regions() {
        let a = DirtyRegion::new(0, 0, 10, 10);
        let b = DirtyRegion::new(5, 5, 10, 10);
        let i = a.intersect(&b).unwrap();
        assert_eq!(i, DirtyRegion::new(5, 5, 5, 5));
    }
}
