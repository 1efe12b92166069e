//! Template matching by normalized cross-correlation
//!
//! [`NccMatcher`] slides the smaller image over the larger one and reports
//! the best correlation coefficient over all placements. Each color channel
//! has its mean removed before correlating (alpha is ignored) and the sums
//! over all channels are normalized together, so identical images score
//! `1.0` and inverted images score `-1.0`.
//!
//! Window sums come from summed-area tables, which keeps the per-placement
//! normalization constant-time. For the common case of equally sized images
//! there is exactly one placement.

use image::RgbaImage;

use crate::error::{LatencyError, LatencyResult};

/// Scores how similar two images are
pub trait ImageMatcher: Send + Sync {
    /// Similarity in `[-1, 1]`, higher is more similar
    ///
    /// # Errors
    ///
    /// Returns `IncompatibleSizes` if neither image fits inside the other.
    fn score(&self, a: &RgbaImage, b: &RgbaImage) -> LatencyResult<f64>;
}

/// Normalized cross-correlation matcher
#[derive(Debug, Clone, Copy, Default)]
pub struct NccMatcher;

impl ImageMatcher for NccMatcher {
    fn score(&self, a: &RgbaImage, b: &RgbaImage) -> LatencyResult<f64> {
        let (search, template) = arrange(a, b)?;
        Ok(best_correlation(search, template))
    }
}

/// Picks which image is searched and which is the template
///
/// `b` becomes the search image only when it is larger than `a` in both
/// dimensions. Whatever the order, the template must then fit inside the
/// search image.
pub fn arrange<'a>(
    a: &'a RgbaImage,
    b: &'a RgbaImage,
) -> LatencyResult<(&'a RgbaImage, &'a RgbaImage)> {
    let (a_width, a_height) = a.dimensions();
    let (b_width, b_height) = b.dimensions();

    if a_width == 0 || a_height == 0 || b_width == 0 || b_height == 0 {
        return Err(LatencyError::ImageError("cannot match an empty image".to_string()));
    }

    let (search, template) = if a_width < b_width && a_height < b_height {
        (b, a)
    } else {
        (a, b)
    };

    if search.width() < template.width() || search.height() < template.height() {
        return Err(LatencyError::IncompatibleSizes {
            first_width:   a_width,
            first_height:  a_height,
            second_width:  b_width,
            second_height: b_height,
        });
    }

    Ok((search, template))
}

const CHANNELS: usize = 3;

type Channels = [f64; CHANNELS];

/// Per-channel summed-area tables of values and squared values
struct SummedArea {
    stride:  usize,
    sums:    Vec<Channels>,
    squares: Vec<Channels>,
}

impl SummedArea {
    fn new(image: &RgbaImage) -> Self {
        let width = image.width() as usize;
        let height = image.height() as usize;
        let stride = width + 1;
        let mut sums = vec![[0.0; CHANNELS]; stride * (height + 1)];
        let mut squares = vec![[0.0; CHANNELS]; stride * (height + 1)];

        for (y, row) in image.as_raw().chunks_exact(width * 4).enumerate() {
            let mut row_sum = [0.0; CHANNELS];
            let mut row_square = [0.0; CHANNELS];
            for (x, pixel) in row.chunks_exact(4).enumerate() {
                let above = y * stride + x + 1;
                let here = above + stride;
                for c in 0..CHANNELS {
                    let value = f64::from(pixel[c]);
                    row_sum[c] += value;
                    row_square[c] += value * value;
                    sums[here][c] = sums[above][c] + row_sum[c];
                    squares[here][c] = squares[above][c] + row_square[c];
                }
            }
        }

        Self {
            stride,
            sums,
            squares,
        }
    }

    fn window(table: &[Channels], stride: usize, x: usize, y: usize, w: usize, h: usize) -> Channels {
        let top_left = table[y * stride + x];
        let top_right = table[y * stride + x + w];
        let bottom_left = table[(y + h) * stride + x];
        let bottom_right = table[(y + h) * stride + x + w];
        let mut out = [0.0; CHANNELS];
        for c in 0..CHANNELS {
            out[c] = bottom_right[c] - top_right[c] - bottom_left[c] + top_left[c];
        }
        out
    }

    fn window_sums(&self, x: usize, y: usize, w: usize, h: usize) -> (Channels, Channels) {
        (
            Self::window(&self.sums, self.stride, x, y, w, h),
            Self::window(&self.squares, self.stride, x, y, w, h),
        )
    }
}

/// Template pixels with each channel's mean removed
struct CenteredTemplate {
    width:  usize,
    height: usize,
    values: Vec<Channels>,
    /// Sum of squared centered values over all channels
    norm:   f64,
}

impl CenteredTemplate {
    fn new(template: &RgbaImage) -> Self {
        let count = f64::from(template.width()) * f64::from(template.height());
        let mut mean = [0.0; CHANNELS];
        for pixel in template.pixels() {
            for c in 0..CHANNELS {
                mean[c] += f64::from(pixel.0[c]);
            }
        }
        for value in &mut mean {
            *value /= count;
        }

        let values: Vec<Channels> = template
            .pixels()
            .map(|pixel| std::array::from_fn(|c| f64::from(pixel.0[c]) - mean[c]))
            .collect();
        let norm = values.iter().flat_map(|v| v.iter()).map(|v| v * v).sum();

        Self {
            width: template.width() as usize,
            height: template.height() as usize,
            values,
            norm,
        }
    }
}

/// Zero-variance threshold for a window, relative to its energy
fn is_flat(variance: f64, energy: f64) -> bool {
    variance <= 0.5_f64.min(10.0 * f64::from(f32::EPSILON) * energy)
}

fn best_correlation(search: &RgbaImage, template: &RgbaImage) -> f64 {
    let template = CenteredTemplate::new(template);
    if template.norm <= f64::EPSILON {
        return 0.0;
    }

    let search_width = search.width() as usize;
    let table = SummedArea::new(search);
    let raw = search.as_raw();
    let count = (template.width * template.height) as f64;
    let mut best = f64::NEG_INFINITY;

    for v in 0..=(search.height() as usize - template.height) {
        for u in 0..=(search_width - template.width) {
            let (sums, squares) = table.window_sums(u, v, template.width, template.height);
            let variance: f64 = (0..CHANNELS)
                .map(|c| squares[c] - sums[c] * sums[c] / count)
                .sum::<f64>()
                .max(0.0);
            let energy: f64 = squares.iter().sum();

            let score = if is_flat(variance, energy) {
                0.0
            } else {
                let mut numerator = 0.0;
                for y in 0..template.height {
                    let search_row = ((v + y) * search_width + u) * 4;
                    let template_row = y * template.width;
                    for x in 0..template.width {
                        let pixel = &raw[search_row + x * 4..search_row + x * 4 + CHANNELS];
                        let centered = &template.values[template_row + x];
                        for c in 0..CHANNELS {
                            numerator += centered[c] * f64::from(pixel[c]);
                        }
                    }
                }
                (numerator / (template.norm * variance).sqrt()).clamp(-1.0, 1.0)
            };

            if score > best {
                best = score;
            }
        }
    }

    best
}
