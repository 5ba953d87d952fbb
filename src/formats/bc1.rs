//! BC1 (DXT1) block compression of RGB(A) tiles.
//!
//! Every 4×4 block of pixels is stored in 8 bytes: two RGB565 endpoints followed by
//! sixteen 2-bit palette indices. Blocks with transparent pixels use the three color
//! mode (`color0 <= color1`), where index 3 is fully transparent.

use itertools::iproduct;

const BLOCK_SIZE: usize = 8;

fn rgb888_to_rgb565([r, g, b]: [u8; 3]) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

fn rgb565_to_rgb888(color: u16) -> [u8; 3] {
    let r = (color >> 11) & 0x1F;
    let g = (color >> 5) & 0x3F;
    let b = color & 0x1F;

    [
        ((r << 3) | (r >> 2)) as u8,
        ((g << 2) | (g >> 4)) as u8,
        ((b << 3) | (b >> 2)) as u8,
    ]
}

fn mix(a: [u8; 3], b: [u8; 3], weight_a: u16, weight_b: u16) -> [u8; 3] {
    let total = weight_a + weight_b;
    [0, 1, 2].map(|i| ((a[i] as u16 * weight_a + b[i] as u16 * weight_b) / total) as u8)
}

fn palette(color0: u16, color1: u16) -> [[u8; 4]; 4] {
    let c0 = rgb565_to_rgb888(color0);
    let c1 = rgb565_to_rgb888(color1);
    let opaque = |[r, g, b]: [u8; 3]| [r, g, b, u8::MAX];

    if color0 > color1 {
        [
            opaque(c0),
            opaque(c1),
            opaque(mix(c0, c1, 2, 1)),
            opaque(mix(c0, c1, 1, 2)),
        ]
    } else {
        [opaque(c0), opaque(c1), opaque(mix(c0, c1, 1, 1)), [0; 4]]
    }
}

fn distance_squared(a: [u8; 4], b: [u8; 4]) -> u32 {
    // weighted towards green, which the eye is most sensitive to
    let dr = (a[0] as i32 - b[0] as i32) * 3;
    let dg = (a[1] as i32 - b[1] as i32) * 6;
    let db = a[2] as i32 - b[2] as i32;
    (dr * dr + dg * dg + db * db) as u32
}

fn is_transparent(pixel: [u8; 4]) -> bool {
    pixel[3] < 128
}

pub(crate) fn compress_block(pixels: &[[u8; 4]; 16]) -> [u8; BLOCK_SIZE] {
    let transparent = pixels.iter().any(|&pixel| is_transparent(pixel));

    let (min, max) = pixels
        .iter()
        .filter(|&&pixel| !is_transparent(pixel))
        .fold(([u8::MAX; 3], [0u8; 3]), |(min, max), pixel| {
            (
                [0, 1, 2].map(|i| min[i].min(pixel[i])),
                [0, 1, 2].map(|i| max[i].max(pixel[i])),
            )
        });

    let (mut color0, mut color1) = if min[0] > max[0] {
        (0, 0) // every pixel is transparent
    } else {
        (rgb888_to_rgb565(max), rgb888_to_rgb565(min))
    };

    if (transparent && color0 > color1) || (!transparent && color0 < color1) {
        std::mem::swap(&mut color0, &mut color1);
    }

    let palette = palette(color0, color1);
    let candidates = if color0 > color1 { 4 } else { 3 };

    let indices = pixels.iter().enumerate().fold(0u32, |indices, (i, &pixel)| {
        let index = if transparent && is_transparent(pixel) {
            3
        } else {
            (0..candidates)
                .min_by_key(|&index| distance_squared(pixel, palette[index]))
                .unwrap_or(0)
        };

        indices | (index as u32) << (2 * i)
    });

    let mut block = [0; BLOCK_SIZE];
    block[0..2].copy_from_slice(&color0.to_le_bytes());
    block[2..4].copy_from_slice(&color1.to_le_bytes());
    block[4..8].copy_from_slice(&indices.to_le_bytes());
    block
}

pub(crate) fn decompress_block(block: &[u8]) -> [[u8; 4]; 16] {
    let color0 = u16::from_le_bytes([block[0], block[1]]);
    let color1 = u16::from_le_bytes([block[2], block[3]]);
    let indices = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);

    let palette = palette(color0, color1);

    std::array::from_fn(|i| palette[((indices >> (2 * i)) & 0b11) as usize])
}

fn block_count(width: usize, height: usize) -> (usize, usize) {
    (width.div_ceil(4), height.div_ceil(4))
}

/// The number of bytes of the blocks covering `width × height` pixels, unless it overflows.
pub(crate) fn compressed_size(width: usize, height: usize) -> Option<usize> {
    let (blocks_x, blocks_y) = block_count(width, height);
    blocks_x.checked_mul(blocks_y)?.checked_mul(BLOCK_SIZE)
}

/// Compresses RGBA pixels in row-major order. Edge blocks repeat the last row and column.
pub(crate) fn compress(pixels: &[[u8; 4]], width: usize, height: usize) -> Vec<u8> {
    let (blocks_x, blocks_y) = block_count(width, height);
    let mut compressed = Vec::with_capacity(compressed_size(width, height).unwrap_or_default());

    for (block_y, block_x) in iproduct!(0..blocks_y, 0..blocks_x) {
        let block = std::array::from_fn(|i| {
            let x = (block_x * 4 + i % 4).min(width - 1);
            let y = (block_y * 4 + i / 4).min(height - 1);
            pixels[y * width + x]
        });

        compressed.extend_from_slice(&compress_block(&block));
    }

    compressed
}

/// Inverse of [`compress`], up to the precision of the format.
pub(crate) fn decompress(compressed: &[u8], width: usize, height: usize) -> Vec<[u8; 4]> {
    let (blocks_x, _) = block_count(width, height);
    let mut pixels = vec![[0; 4]; width * height];

    for (block_index, block) in compressed.chunks_exact(BLOCK_SIZE).enumerate() {
        let block_x = block_index % blocks_x;
        let block_y = block_index / blocks_x;

        for (i, pixel) in decompress_block(block).into_iter().enumerate() {
            let x = block_x * 4 + i % 4;
            let y = block_y * 4 + i / 4;

            if x < width && y < height {
                pixels[y * width + x] = pixel;
            }
        }
    }

    pixels
}
