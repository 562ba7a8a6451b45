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


//! VNC Tight encoding implementation - RFC 6143 compliant with full optimization
//!
//! # Architecture
//!
//! This implementation has TWO layers for optimal compression:
//!
//! ## Layer 1: High-Level Optimization
//! - Rectangle splitting and subdivision
//! - Solid area detection and extraction
//! - Recursive optimization for best encoding
//! - Size limit enforcement (TIGHT_MAX_RECT_SIZE, TIGHT_MAX_RECT_WIDTH)
//!
//! ## Layer 2: Low-Level Encoding
//! - Palette analysis
//! - Encoding mode selection (solid/mono/indexed/full-color/JPEG)
//! - Compression and wire format generation
//!
//! # Protocol Overview
//!
//! Tight encoding supports 5 compression modes:
//!
//! 1. **Solid fill** (1 color) - control byte 0x80
//!    - Wire format: `[0x80][R][G][B]` (4 bytes total)
//!    - Most efficient for solid color rectangles
//!
//! 2. **Mono rect** (2 colors) - control byte 0x50 or 0xA0
//!    - Wire format: `[control][0x01][1][bg RGB24][fg RGB24][length][bitmap]`
//!    - Uses 1-bit bitmap: 0=background, 1=foreground
//!    - MSB first, each row byte-aligned
//!
//! 3. **Indexed palette** (3-16 colors) - control byte 0x60 or 0xA0
//!    - Wire format: `[control][0x01][n-1][colors...][length][indices]`
//!    - Each pixel encoded as palette index (1 byte)
//!
//! 4. **Full-color zlib** - control byte 0x00 or 0xA0
//!    - Wire format: `[control][length][zlib compressed RGB24]`
//!    - Lossless compression for truecolor images
//!
//! 5. **JPEG** - control byte 0x90
//!    - Wire format: `[0x90][length][JPEG data]`
//!    - Lossy compression for photographic content
//!
//! # Persistent compression
//!
//! RFC 6143 section 7.7.4 requires the three zlib sub-streams (full-color,
//! mono, indexed) to persist across rectangles within a session, the same
//! way the standalone Zlib/ZlibHex/ZRLE encodings do. [`TightStreams`] holds
//! those three [`Compress`] instances; callers that need session-persistent
//! output should use [`encode_persistent`] rather than the stateless
//! [`Encoding`] impl below (which exists for the `get_encoder` factory and
//! one-shot callers, and opens a fresh stream per call).
//!
//! # Configuration Constants
//!
//! ```text
//! TIGHT_MIN_TO_COMPRESS = 12      (data < 12 bytes sent raw)
//! MIN_SPLIT_RECT_SIZE = 4096      (split rectangles >= 4096 pixels)
//! MIN_SOLID_SUBRECT_SIZE = 2048   (solid areas must be >= 2048 pixels)
//! MAX_SPLIT_TILE_SIZE = 16        (tile size for solid detection)
//! TIGHT_MAX_RECT_SIZE = 65536     (max pixels per rectangle)
//! TIGHT_MAX_RECT_WIDTH = 2048     (max rectangle width)
//! ```

use bytes::{BufMut, BytesMut};
use flate2::{Compress, Compression, FlushCompress};
use std::collections::HashMap;
use super::Encoding;
use super::common::put_pixel24;
use log::info;

// Tight encoding protocol constants (RFC 6143 section 7.7.4)
const TIGHT_EXPLICIT_FILTER: u8 = 0x04;
const TIGHT_FILL: u8 = 0x08;
#[allow(dead_code)]
const TIGHT_JPEG: u8 = 0x09;
const TIGHT_NO_ZLIB: u8 = 0x0A;

// Filter types
const TIGHT_FILTER_PALETTE: u8 = 0x01;

/// Zlib stream ID for full-color data (RFC 6143 section 7.7.4)
pub const STREAM_ID_FULL_COLOR: u8 = 0;
/// Zlib stream ID for monochrome bitmap data (RFC 6143 section 7.7.4)
pub const STREAM_ID_MONO: u8 = 1;
/// Zlib stream ID for indexed palette data (RFC 6143 section 7.7.4)
pub const STREAM_ID_INDEXED: u8 = 2;

// Compression thresholds for Tight encoding optimization
const TIGHT_MIN_TO_COMPRESS: usize = 12;
const MIN_SPLIT_RECT_SIZE: usize = 4096;
const MIN_SOLID_SUBRECT_SIZE: usize = 2048;
const MAX_SPLIT_TILE_SIZE: u16 = 16;
const TIGHT_MAX_RECT_SIZE: usize = 65536;
const TIGHT_MAX_RECT_WIDTH: u16 = 2048;

/// Compression configuration for different quality levels
struct TightConf {
    mono_min_rect_size: usize,
    idx_zlib_level: u8,
    mono_zlib_level: u8,
    raw_zlib_level: u8,
}

const TIGHT_CONF: [TightConf; 4] = [
    TightConf { mono_min_rect_size: 6, idx_zlib_level: 0, mono_zlib_level: 0, raw_zlib_level: 0 },  // Level 0
    TightConf { mono_min_rect_size: 32, idx_zlib_level: 1, mono_zlib_level: 1, raw_zlib_level: 1 }, // Level 1
    TightConf { mono_min_rect_size: 32, idx_zlib_level: 3, mono_zlib_level: 3, raw_zlib_level: 2 }, // Level 2
    TightConf { mono_min_rect_size: 32, idx_zlib_level: 7, mono_zlib_level: 7, raw_zlib_level: 5 }, // Level 9
];

/// Rectangle to encode
#[derive(Debug, Clone)]
struct Rect {
    x: u16,
    y: u16,
    w: u16,
    h: u16,
}

/// Result of encoding a rectangle
struct EncodeResult {
    rectangles: Vec<(Rect, BytesMut)>,
}

/// Holds the three persistent zlib streams Tight multiplexes data through
/// (RFC 6143 section 7.7.4: full-color, mono-bitmap, and indexed-palette
/// each get their own stream so repeated rectangles of the same kind keep
/// benefiting from the other rectangles' dictionary).
pub struct TightStreams {
    full_color: Compress,
    mono: Compress,
    indexed: Compress,
}

impl TightStreams {
    /// Builds fresh streams at the given zlib compression level (0-9).
    #[must_use]
    pub fn new(level: u8) -> Self {
        let comp = Compression::new(u32::from(level));
        Self {
            full_color: Compress::new(comp, true),
            mono: Compress::new(comp, true),
            indexed: Compress::new(comp, true),
        }
    }
}

/// Implements the VNC "Tight" encoding (RFC 6143 section 7.7.4).
pub struct TightEncoding;

impl Encoding for TightEncoding {
    fn encode(&self, data: &[u8], width: u16, height: u16, quality: u8, compression: u8) -> BytesMut {
        // Stateless one-shot path (used by `encoding::get_encoder`): each call
        // gets its own streams, so cross-rectangle compression state is lost.
        // Session code that wants RFC 6143's persistent streams should call
        // `encode_persistent` with state it keeps across updates.
        let mut streams = TightStreams::new(6);
        encode_persistent(data, width, height, quality, compression, &mut streams)
    }
}

/// Encodes one rectangle of RGBA framebuffer data as Tight, compressing
/// through the session's persistent streams.
#[must_use]
pub fn encode_persistent(
    data: &[u8],
    width: u16,
    height: u16,
    quality: u8,
    compression: u8,
    streams: &mut TightStreams,
) -> BytesMut {
    let rect = Rect { x: 0, y: 0, w: width, h: height };
    let result = encode_rect_optimized(data, width, &rect, quality, compression, streams);

    let mut output = BytesMut::new();
    for (_rect, buf) in result.rectangles {
        output.extend_from_slice(&buf);
    }
    output
}

/// High-level optimization: split rectangles and find solid areas
/// Implements Tight encoding optimization as specified in RFC 6143
fn encode_rect_optimized(
    framebuffer: &[u8],
    fb_width: u16,
    rect: &Rect,
    quality: u8,
    compression: u8,
    streams: &mut TightStreams,
) -> EncodeResult {
    let mut rectangles = Vec::new();

    // Normalize compression level based on quality settings
    let compression = normalize_compression_level(compression, quality);

    // Check if optimization should be applied
    if (rect.w as usize * rect.h as usize) < MIN_SPLIT_RECT_SIZE {
        // Too small - encode directly
        let buf = encode_subrect(framebuffer, fb_width, rect, quality, compression, streams);
        rectangles.push((rect.clone(), buf));
        return EncodeResult { rectangles };
    }

    // Calculate maximum rows per rectangle
    let n_max_width = rect.w.min(TIGHT_MAX_RECT_WIDTH);
    let n_max_rows = (TIGHT_MAX_RECT_SIZE / n_max_width as usize) as u16;

    // Try to find large solid-color areas for optimization
    let mut current_y = rect.y;
    let mut remaining_h = rect.h;

    while current_y < rect.y + rect.h {
        // Check if rectangle becomes too large
        if (current_y - rect.y) >= n_max_rows {
            let chunk_rect = Rect {
                x: rect.x,
                y: rect.y + (current_y - rect.y - n_max_rows),
                w: rect.w,
                h: n_max_rows,
            };
            let buf = encode_subrect(framebuffer, fb_width, &chunk_rect, quality, compression, streams);
            rectangles.push((chunk_rect, buf));
            remaining_h -= n_max_rows;
        }

        let dy_end = (current_y + MAX_SPLIT_TILE_SIZE).min(rect.y + rect.h);
        let dh = dy_end - current_y;

        let mut current_x = rect.x;
        while current_x < rect.x + rect.w {
            let dx_end = (current_x + MAX_SPLIT_TILE_SIZE).min(rect.x + rect.w);
            let dw = dx_end - current_x;

            // Check if tile is solid
            if let Some(color_value) = check_solid_tile(framebuffer, fb_width, current_x, current_y, dw, dh, None) {
                // Find best solid area
                let (w_best, h_best) = find_best_solid_area(
                    framebuffer,
                    fb_width,
                    current_x,
                    current_y,
                    rect.w - (current_x - rect.x),
                    remaining_h - (current_y - rect.y),
                    color_value,
                );

                // Check if solid area is large enough
                if w_best * h_best != rect.w * remaining_h && (w_best as usize * h_best as usize) < MIN_SOLID_SUBRECT_SIZE {
                    current_x += dw;
                    continue;
                }

                // Extend solid area
                let (x_best, y_best, w_best, h_best) = extend_solid_area(
                    framebuffer,
                    fb_width,
                    rect.x,
                    current_y,
                    rect.w,
                    remaining_h,
                    color_value,
                    current_x,
                    current_y,
                    w_best,
                    h_best,
                );

                // Send rectangles before solid area
                if y_best != current_y {
                    let top_rect = Rect {
                        x: rect.x,
                        y: current_y,
                        w: rect.w,
                        h: y_best - current_y,
                    };
                    let buf = encode_subrect(framebuffer, fb_width, &top_rect, quality, compression, streams);
                    rectangles.push((top_rect, buf));
                }

                if x_best != rect.x {
                    let left_rect = Rect {
                        x: rect.x,
                        y: y_best,
                        w: x_best - rect.x,
                        h: h_best,
                    };
                    let sub_result = encode_rect_optimized(framebuffer, fb_width, &left_rect, quality, compression, streams);
                    rectangles.extend(sub_result.rectangles);
                }

                // Send solid rectangle
                let solid_rect = Rect {
                    x: x_best,
                    y: y_best,
                    w: w_best,
                    h: h_best,
                };
                let buf = encode_solid_rect(color_value);
                rectangles.push((solid_rect, buf));

                // Send remaining rectangles
                if x_best + w_best != rect.x + rect.w {
                    let right_rect = Rect {
                        x: x_best + w_best,
                        y: y_best,
                        w: rect.w - (x_best - rect.x) - w_best,
                        h: h_best,
                    };
                    let sub_result = encode_rect_optimized(framebuffer, fb_width, &right_rect, quality, compression, streams);
                    rectangles.extend(sub_result.rectangles);
                }

                if y_best + h_best != current_y + remaining_h {
                    let bottom_rect = Rect {
                        x: rect.x,
                        y: y_best + h_best,
                        w: rect.w,
                        h: remaining_h - (y_best - current_y) - h_best,
                    };
                    let sub_result = encode_rect_optimized(framebuffer, fb_width, &bottom_rect, quality, compression, streams);
                    rectangles.extend(sub_result.rectangles);
                }

                return EncodeResult { rectangles };
            }

            current_x += dw;
        }

        current_y += dh;
    }

    // No solid areas found - encode normally
    let buf = encode_subrect(framebuffer, fb_width, rect, quality, compression, streams);
    rectangles.push((rect.clone(), buf));
    EncodeResult { rectangles }
}

/// Normalize compression level based on JPEG quality
/// Maps compression level 0-9 to internal configuration indices
fn normalize_compression_level(compression: u8, quality: u8) -> u8 {
    let mut level = compression;

    // Map compression level 0-9 to 0-3 (configuration array indices)
    if level == 9 {
        level = 3;
    } else if level > 1 {
        if quality < 10 {
            // JPEG enabled - allow level 2
            level = level.min(2);
        } else {
            // JPEG disabled - cap at level 1
            level = level.min(1);
        }
    }

    level
}

/// Low-level encoding: analyze and encode a single subrectangle
/// Analyzes palette and selects optimal encoding mode
fn encode_subrect(
    framebuffer: &[u8],
    fb_width: u16,
    rect: &Rect,
    quality: u8,
    compression: u8,
    streams: &mut TightStreams,
) -> BytesMut {
    // Split if too large
    if rect.w > TIGHT_MAX_RECT_WIDTH || ((rect.w as usize) * (rect.h as usize)) > TIGHT_MAX_RECT_SIZE {
        return encode_large_rect(framebuffer, fb_width, rect, quality, compression, streams);
    }

    // Extract pixel data for this rectangle
    let pixels = extract_rect_rgba(framebuffer, fb_width, rect);

    // Analyze palette
    let palette = analyze_palette(&pixels, rect.w as usize * rect.h as usize, compression);

    // Route to appropriate encoder based on palette
    match palette.num_colors {
        0 => {
            // Truecolor - use JPEG or full-color
            if quality < 10 {
                encode_jpeg_rect(&pixels, rect.w, rect.h, quality, &mut streams.full_color)
            } else {
                encode_full_color_rect(&pixels, rect.w, rect.h, compression, &mut streams.full_color)
            }
        }
        1 => {
            // Solid color
            encode_solid_rect(palette.colors[0])
        }
        2 if palette.use_mono => {
            // Mono rect (2 colors, rect large enough to justify a bitmap)
            encode_mono_rect(&pixels, rect.w, rect.h, palette.colors[0], palette.colors[1], compression, &mut streams.mono)
        }
        n => {
            // Indexed palette (2-16 colors, including small 2-color rects
            // that didn't meet the mono threshold)
            encode_indexed_rect(&pixels, rect.w, rect.h, &palette.colors[..n], compression, &mut streams.indexed)
        }
    }
}

/// Encode large rectangle by splitting it into smaller tiles
/// Ensures rectangles stay within size limits
fn encode_large_rect(
    framebuffer: &[u8],
    fb_width: u16,
    rect: &Rect,
    quality: u8,
    compression: u8,
    streams: &mut TightStreams,
) -> BytesMut {
    let subrect_max_width = rect.w.min(TIGHT_MAX_RECT_WIDTH);
    let subrect_max_height = (TIGHT_MAX_RECT_SIZE / subrect_max_width as usize) as u16;

    let mut output = BytesMut::new();

    let mut dy = 0;
    while dy < rect.h {
        let mut dx = 0;
        while dx < rect.w {
            let rw = (rect.w - dx).min(TIGHT_MAX_RECT_WIDTH);
            let rh = (rect.h - dy).min(subrect_max_height);

            let sub_rect = Rect {
                x: rect.x + dx,
                y: rect.y + dy,
                w: rw,
                h: rh,
            };

            let buf = encode_subrect(framebuffer, fb_width, &sub_rect, quality, compression, streams);
            output.extend_from_slice(&buf);

            dx += TIGHT_MAX_RECT_WIDTH;
        }
        dy += subrect_max_height;
    }

    output
}

/// Check if a tile is all the same color
/// Used for solid area detection optimization
fn check_solid_tile(
    framebuffer: &[u8],
    fb_width: u16,
    x: u16,
    y: u16,
    w: u16,
    h: u16,
    need_same_color: Option<u32>,
) -> Option<u32> {
    let _fb_stride = fb_width as usize * 4; // RGBA32
    let offset = (y as usize * fb_width as usize + x as usize) * 4;

    // Get first pixel color (RGB24)
    let first_color = rgba_to_rgb24(
        framebuffer[offset],
        framebuffer[offset + 1],
        framebuffer[offset + 2],
    );

    // Check if we need a specific color
    if let Some(required) = need_same_color {
        if first_color != required {
            return None;
        }
    }

    // Check all pixels
    for dy in 0..h {
        let row_offset = ((y + dy) as usize * fb_width as usize + x as usize) * 4;
        for dx in 0..w {
            let pix_offset = row_offset + dx as usize * 4;
            let color = rgba_to_rgb24(
                framebuffer[pix_offset],
                framebuffer[pix_offset + 1],
                framebuffer[pix_offset + 2],
            );
            if color != first_color {
                return None;
            }
        }
    }

    Some(first_color)
}

/// Find best solid area dimensions
/// Determines optimal size for solid color subrectangle
fn find_best_solid_area(
    framebuffer: &[u8],
    fb_width: u16,
    x: u16,
    y: u16,
    w: u16,
    h: u16,
    color_value: u32,
) -> (u16, u16) {
    let mut w_best = 0;
    let mut h_best = 0;
    let mut w_prev = w;

    let mut dy = 0;
    while dy < h {
        let dh = (h - dy).min(MAX_SPLIT_TILE_SIZE);
        let dw = w_prev.min(MAX_SPLIT_TILE_SIZE);

        if check_solid_tile(framebuffer, fb_width, x, y + dy, dw, dh, Some(color_value)).is_none() {
            break;
        }

        let mut dx = dw;
        while dx < w_prev {
            let dw_check = (w_prev - dx).min(MAX_SPLIT_TILE_SIZE);
            if check_solid_tile(framebuffer, fb_width, x + dx, y + dy, dw_check, dh, Some(color_value)).is_none() {
                break;
            }
            dx += dw_check;
        }

        w_prev = dx;
        if (w_prev as usize * (dy + dh) as usize) > (w_best as usize * h_best as usize) {
            w_best = w_prev;
            h_best = dy + dh;
        }

        dy += dh;
    }

    (w_best, h_best)
}

/// Extend solid area to maximum size
/// Expands solid region in all directions
fn extend_solid_area(
    framebuffer: &[u8],
    fb_width: u16,
    base_x: u16,
    base_y: u16,
    max_w: u16,
    max_h: u16,
    color_value: u32,
    mut x: u16,
    mut y: u16,
    mut w: u16,
    mut h: u16,
) -> (u16, u16, u16, u16) {
    // Extend upwards
    while y > base_y {
        if check_solid_tile(framebuffer, fb_width, x, y - 1, w, 1, Some(color_value)).is_none() {
            break;
        }
        y -= 1;
        h += 1;
    }

    // Extend downwards
    while y + h < base_y + max_h {
        if check_solid_tile(framebuffer, fb_width, x, y + h, w, 1, Some(color_value)).is_none() {
            break;
        }
        h += 1;
    }

    // Extend left
    while x > base_x {
        if check_solid_tile(framebuffer, fb_width, x - 1, y, 1, h, Some(color_value)).is_none() {
            break;
        }
        x -= 1;
        w += 1;
    }

    // Extend right
    while x + w < base_x + max_w {
        if check_solid_tile(framebuffer, fb_width, x + w, y, 1, h, Some(color_value)).is_none() {
            break;
        }
        w += 1;
    }

    (x, y, w, h)
}

/// Palette analysis result
struct Palette {
    num_colors: usize,
    colors: [u32; 256],
    /// True when the 2-color case should use the mono bitmap representation
    /// rather than a 2-entry indexed palette (libvncserver only bothers with
    /// the bitmap once the rectangle is large enough for the 1-bit packing
    /// to pay for its header).
    use_mono: bool,
}

/// Analyze palette from pixel data
/// Determines color count and encoding mode selection (1 solid color, 2
/// colors, 3-16 colors indexed, or too many for a palette at all).
fn analyze_palette(pixels: &[u8], pixel_count: usize, compression: u8) -> Palette {
    let conf_idx = match compression {
        0 => 0,
        1 => 1,
        2 | 3 => 2,
        _ => 3,
    };
    let conf = &TIGHT_CONF[conf_idx];

    let mut palette = Palette {
        num_colors: 0,
        colors: [0; 256],
        use_mono: false,
    };

    if pixel_count == 0 {
        return palette;
    }

    // Collect distinct colors in first-seen order, bailing out to the
    // truecolor/JPEG path as soon as a 17th distinct color appears (Tight's
    // indexed mode tops out at 16 palette entries).
    let mut order: Vec<u32> = Vec::with_capacity(16);
    let mut counts: HashMap<u32, usize> = HashMap::with_capacity(16);

    for chunk in pixels.chunks_exact(4) {
        let color = rgba_to_rgb24(chunk[0], chunk[1], chunk[2]);
        let count = counts.entry(color).or_insert_with(|| {
            order.push(color);
            0
        });
        *count += 1;
        if order.len() > 16 {
            return palette; // too many colors for a palette
        }
    }

    if order.len() == 1 {
        palette.num_colors = 1;
        palette.colors[0] = order[0];
        return palette;
    }

    if order.len() == 2 {
        let (bg, fg) = if counts[&order[0]] >= counts[&order[1]] {
            (order[0], order[1])
        } else {
            (order[1], order[0])
        };
        palette.num_colors = 2;
        palette.colors[0] = bg;
        palette.colors[1] = fg;
        palette.use_mono = pixel_count >= conf.mono_min_rect_size;
        return palette;
    }

    // 3-16 colors: indexed palette, most frequent color first.
    let mut sorted = order;
    sorted.sort_by_key(|c| std::cmp::Reverse(counts[c]));
    palette.num_colors = sorted.len();
    for (i, color) in sorted.into_iter().enumerate() {
        palette.colors[i] = color;
    }
    palette
}

/// Extract RGBA rectangle from framebuffer
fn extract_rect_rgba(framebuffer: &[u8], fb_width: u16, rect: &Rect) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(rect.w as usize * rect.h as usize * 4);

    for y in 0..rect.h {
        let row_offset = ((rect.y + y) as usize * fb_width as usize + rect.x as usize) * 4;
        let row_end = row_offset + rect.w as usize * 4;
        pixels.extend_from_slice(&framebuffer[row_offset..row_end]);
    }

    pixels
}

/// Convert RGBA to RGB24
#[inline]
fn rgba_to_rgb24(r: u8, g: u8, b: u8) -> u32 {
    ((r as u32) << 16) | ((g as u32) << 8) | (b as u32)
}

/// Encode solid rectangle
/// Implements solid fill encoding mode (1 color)
fn encode_solid_rect(color: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(TIGHT_FILL << 4); // 0x80
    put_pixel24(&mut buf, color);
    info!("Tight solid: 0x{:06x}, {} bytes", color, buf.len());
    buf
}

/// Encode mono rectangle (2 colors)
/// Implements monochrome bitmap encoding with palette
fn encode_mono_rect(
    pixels: &[u8],
    width: u16,
    height: u16,
    bg: u32,
    fg: u32,
    compression: u8,
    stream: &mut Compress,
) -> BytesMut {
    let conf_idx = match compression {
        0 => 0,
        1 => 1,
        2 | 3 => 2,
        _ => 3,
    };
    let zlib_level = TIGHT_CONF[conf_idx].mono_zlib_level;

    // Encode bitmap
    let bitmap = encode_mono_bitmap(pixels, width, height, bg);

    let mut buf = BytesMut::new();

    // Control byte
    if zlib_level == 0 {
        buf.put_u8((TIGHT_NO_ZLIB | TIGHT_EXPLICIT_FILTER) << 4);
    } else {
        buf.put_u8((STREAM_ID_MONO | TIGHT_EXPLICIT_FILTER) << 4);
    }

    // Filter and palette
    buf.put_u8(TIGHT_FILTER_PALETTE);
    buf.put_u8(1); // 2 colors - 1

    // Palette colors
    put_pixel24(&mut buf, bg);
    put_pixel24(&mut buf, fg);

    // Compress data
    compress_data(&mut buf, &bitmap, zlib_level, stream);

    info!("Tight mono: {}x{}, {} bytes", width, height, buf.len());
    buf
}

/// Encode indexed palette rectangle (2-16 colors)
/// Implements palette-based encoding with color indices
fn encode_indexed_rect(
    pixels: &[u8],
    width: u16,
    height: u16,
    palette: &[u32],
    compression: u8,
    stream: &mut Compress,
) -> BytesMut {
    let conf_idx = match compression {
        0 => 0,
        1 => 1,
        2 | 3 => 2,
        _ => 3,
    };
    let zlib_level = TIGHT_CONF[conf_idx].idx_zlib_level;

    // Build color-to-index map
    let mut color_map = HashMap::new();
    for (idx, &color) in palette.iter().enumerate() {
        color_map.insert(color, idx as u8);
    }

    // Encode indices
    let mut indices = Vec::with_capacity(width as usize * height as usize);
    for chunk in pixels.chunks_exact(4) {
        let color = rgba_to_rgb24(chunk[0], chunk[1], chunk[2]);
        indices.push(*color_map.get(&color).unwrap_or(&0));
    }

    let mut buf = BytesMut::new();

    // Control byte
    if zlib_level == 0 {
        buf.put_u8((TIGHT_NO_ZLIB | TIGHT_EXPLICIT_FILTER) << 4);
    } else {
        buf.put_u8((STREAM_ID_INDEXED | TIGHT_EXPLICIT_FILTER) << 4);
    }

    // Filter and palette size
    buf.put_u8(TIGHT_FILTER_PALETTE);
    buf.put_u8((palette.len() - 1) as u8);

    // Palette colors
    for &color in palette {
        put_pixel24(&mut buf, color);
    }

    // Compress data
    compress_data(&mut buf, &indices, zlib_level, stream);

    info!("Tight indexed: {} colors, {}x{}, {} bytes", palette.len(), width, height, buf.len());
    buf
}

/// Encode full-color rectangle
/// Implements full-color zlib encoding for truecolor images
fn encode_full_color_rect(
    pixels: &[u8],
    width: u16,
    height: u16,
    compression: u8,
    stream: &mut Compress,
) -> BytesMut {
    let conf_idx = match compression {
        0 => 0,
        1 => 1,
        2 | 3 => 2,
        _ => 3,
    };
    let zlib_level = TIGHT_CONF[conf_idx].raw_zlib_level;

    // Convert RGBA to RGB24
    let mut rgb_data = Vec::with_capacity(width as usize * height as usize * 3);
    for chunk in pixels.chunks_exact(4) {
        rgb_data.push(chunk[0]);
        rgb_data.push(chunk[1]);
        rgb_data.push(chunk[2]);
    }

    let mut buf = BytesMut::new();

    // Control byte
    if zlib_level == 0 {
        buf.put_u8(TIGHT_NO_ZLIB << 4);
    } else {
        buf.put_u8(STREAM_ID_FULL_COLOR << 4);
    }

    // Compress data
    compress_data(&mut buf, &rgb_data, zlib_level, stream);

    info!("Tight full-color: {}x{}, {} bytes", width, height, buf.len());
    buf
}

/// Encode JPEG rectangle
/// Implements lossy JPEG compression for photographic content
///
/// `full_color_stream` is the session's persistent stream-0 `Compress`,
/// the same one `encode_full_color_rect` uses for the non-JPEG truecolor
/// path — any fallback to full-color zlib here must compress through it
/// rather than a throwaway stream, or the client's stream-0 inflate
/// context desyncs on the next rectangle that reuses it.
fn encode_jpeg_rect(
    pixels: &[u8],
    width: u16,
    height: u16,
    quality: u8,
    full_color_stream: &mut Compress,
) -> BytesMut {
    #[cfg(feature = "turbojpeg")]
    {
        use crate::jpeg::TurboJpegEncoder;

        // Convert RGBA to RGB
        let mut rgb_data = Vec::with_capacity(width as usize * height as usize * 3);
        for chunk in pixels.chunks_exact(4) {
            rgb_data.push(chunk[0]);
            rgb_data.push(chunk[1]);
            rgb_data.push(chunk[2]);
        }

        // Compress with TurboJPEG
        let jpeg_data = match TurboJpegEncoder::new() {
            Ok(mut encoder) => {
                match encoder.compress_rgb(&rgb_data, width, height, quality) {
                    Ok(data) => data,
                    Err(e) => {
                        info!("TurboJPEG failed: {}, using full-color", e);
                        return encode_full_color_rect(pixels, width, height, 6, full_color_stream);
                    }
                }
            }
            Err(e) => {
                info!("TurboJPEG init failed: {}, using full-color", e);
                return encode_full_color_rect(pixels, width, height, 6, full_color_stream);
            }
        };

        let mut buf = BytesMut::new();
        buf.put_u8(TIGHT_JPEG << 4); // 0x90
        write_compact_length(&mut buf, jpeg_data.len());
        buf.put_slice(&jpeg_data);

        info!("Tight JPEG: {}x{}, quality {}, {} bytes", width, height, quality, jpeg_data.len());
        buf
    }

    #[cfg(not(feature = "turbojpeg"))]
    {
        info!("TurboJPEG not enabled, using full-color (quality={})", quality);
        encode_full_color_rect(pixels, width, height, 6, full_color_stream)
    }
}

/// Compress data through a persistent zlib stream, or send uncompressed
/// Handles compression based on data size and level settings
#[allow(clippy::cast_possible_truncation)] // zlib total_in/total_out bounded by buffer size
fn compress_data(buf: &mut BytesMut, data: &[u8], zlib_level: u8, stream: &mut Compress) {
    // Data < 12 bytes sent raw WITHOUT length
    if data.len() < TIGHT_MIN_TO_COMPRESS {
        buf.put_slice(data);
        return;
    }

    // zlibLevel == 0 means uncompressed WITH length
    if zlib_level == 0 {
        write_compact_length(buf, data.len());
        buf.put_slice(data);
        return;
    }

    // Compress through the session's persistent stream (Z_SYNC_FLUSH per
    // rectangle, matching the other persistent encodings' RFC 6143 approach).
    let max_compressed_size = data.len() + (data.len() / 1000) + 12;
    let mut compressed_output = vec![0u8; max_compressed_size];

    let previous_in = stream.total_in();
    let previous_out = stream.total_out();

    match stream.compress(data, &mut compressed_output, FlushCompress::Sync) {
        Ok(_) => {
            let compressed_len = (stream.total_out() - previous_out) as usize;
            let consumed = (stream.total_in() - previous_in) as usize;
            if consumed < data.len() {
                // Incomplete consumption: send uncompressed rather than
                // desync the persistent stream's state.
                write_compact_length(buf, data.len());
                buf.put_slice(data);
                return;
            }
            write_compact_length(buf, compressed_len);
            buf.put_slice(&compressed_output[..compressed_len]);
        }
        Err(_) => {
            write_compact_length(buf, data.len());
            buf.put_slice(data);
        }
    }
}

/// Encode mono bitmap (1 bit per pixel)
/// Converts 2-color image to packed bitmap format
fn encode_mono_bitmap(pixels: &[u8], width: u16, height: u16, bg: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let bytes_per_row = (w + 7) / 8;
    let mut bitmap = vec![0u8; bytes_per_row * h];

    let mut bitmap_idx = 0;
    for y in 0..h {
        let mut byte_val = 0u8;
        let mut bit_pos = 7i32; // MSB first

        for x in 0..w {
            let pix_offset = (y * w + x) * 4;
            let color = rgba_to_rgb24(pixels[pix_offset], pixels[pix_offset + 1], pixels[pix_offset + 2]);

            if color != bg {
                byte_val |= 1 << bit_pos;
            }

            if bit_pos == 0 {
                bitmap[bitmap_idx] = byte_val;
                bitmap_idx += 1;
                byte_val = 0;
                bit_pos = 7;
            } else {
                bit_pos -= 1;
            }
        }

        // Write partial byte at end of row
        if w % 8 != 0 {
            bitmap[bitmap_idx] = byte_val;
            bitmap_idx += 1;
        }
    }

    bitmap
}

/// Write compact length encoding
/// Implements variable-length integer encoding for Tight protocol
fn write_compact_length(buf: &mut BytesMut, len: usize) {
    if len < 128 {
        buf.put_u8(len as u8);
    } else if len < 16384 {
        buf.put_u8(((len & 0x7F) | 0x80) as u8);
        buf.put_u8((len >> 7) as u8);
    } else {
        buf.put_u8(((len & 0x7F) | 0x80) as u8);
        buf.put_u8((((len >> 7) & 0x7F) | 0x80) as u8);
        buf.put_u8((len >> 14) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_rgba(color: (u8, u8, u8), w: u16, h: u16) -> Vec<u8> {
        let mut data = Vec::with_capacity(w as usize * h as usize * 4);
        for _ in 0..(w as usize * h as usize) {
            data.extend_from_slice(&[color.0, color.1, color.2, 0xFF]);
        }
        data
    }

    #[test]
    fn solid_fill_is_byte_exact() {
        let data = solid_rgba((0x11, 0x22, 0x33), 64, 64);
        let mut streams = TightStreams::new(6);
        let encoded = encode_persistent(&data, 64, 64, 100, 6, &mut streams);
        assert_eq!(&encoded[..4], &[0x80, 0x11, 0x22, 0x33]);
    }

    #[test]
    fn two_color_small_rect_uses_indexed_not_mono() {
        // Below TIGHT_CONF's mono_min_rect_size, so analyze_palette should
        // route this through the indexed path (use_mono == false) with a
        // 2-entry palette rather than a 1-bit bitmap.
        let mut data = Vec::new();
        data.extend_from_slice(&[0xFF, 0, 0, 0xFF]);
        data.extend_from_slice(&[0, 0xFF, 0, 0xFF]);
        let palette = analyze_palette(&data, 2, 9);
        assert_eq!(palette.num_colors, 2);
        assert!(!palette.use_mono);
    }

    #[test]
    fn three_to_sixteen_colors_are_indexed() {
        let mut data = Vec::new();
        for i in 0..5u8 {
            for _ in 0..20 {
                data.extend_from_slice(&[i, i, i, 0xFF]);
            }
        }
        let palette = analyze_palette(&data, 100, 6);
        assert_eq!(palette.num_colors, 5);
    }

    #[test]
    fn seventeen_colors_fall_back_to_truecolor() {
        let mut data = Vec::new();
        for i in 0..17u8 {
            data.extend_from_slice(&[i, i, i, 0xFF]);
        }
        let palette = analyze_palette(&data, 17, 6);
        assert_eq!(palette.num_colors, 0);
    }

    #[test]
    fn persistent_streams_carry_state_across_calls() {
        // Same full-color data encoded twice through the same stream should
        // compress smaller the second time once the dictionary has useful
        // history, and in any case must not error out.
        let data = solid_rgba((1, 2, 3), 40, 40)
            .iter()
            .enumerate()
            .map(|(i, &b)| b ^ ((i % 7) as u8)) // avoid a trivially solid tile
            .collect::<Vec<u8>>();
        let mut streams = TightStreams::new(6);
        let first = encode_persistent(&data, 40, 40, 100, 6, &mut streams);
        let second = encode_persistent(&data, 40, 40, 100, 6, &mut streams);
        assert!(!first.is_empty());
        assert!(!second.is_empty());
    }

    #[test]
    fn jpeg_rect_fallback_reuses_caller_stream_across_calls() {
        // Without the `turbojpeg` feature (the default), quality<10 always
        // falls back to full-color zlib inside encode_jpeg_rect. That
        // fallback must compress through the caller's persistent stream
        // rather than a fresh one, or the client's stream-0 inflate
        // context desyncs after the first rectangle sent this way.
        let mut streams = TightStreams::new(6);
        let noisy = |seed: u8| {
            solid_rgba((seed, seed.wrapping_add(10), seed.wrapping_add(20)), 32, 32)
                .iter()
                .enumerate()
                .map(|(i, &b)| b ^ ((i as u8).wrapping_add(seed) % 5))
                .collect::<Vec<u8>>()
        };

        let _first = encode_jpeg_rect(&noisy(1), 32, 32, 5, &mut streams.full_color);
        let total_out_after_first = streams.full_color.total_out();
        assert!(total_out_after_first > 0);

        let _second = encode_jpeg_rect(&noisy(2), 32, 32, 5, &mut streams.full_color);
        let total_out_after_second = streams.full_color.total_out();

        // A throwaway stream fabricated per call would leave the caller's
        // stream untouched on the second call.
        assert!(total_out_after_second > total_out_after_first);
    }
}
