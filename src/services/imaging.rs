//! Pixel-level primitives shared by the normalizer, classifier and analyzers.
//!
//! Everything here is a pure function over `image` buffers. HSV values use the
//! 8-bit convention H ∈ [0, 179], S and V ∈ [0, 255] so thresholds read the
//! same as the layout constants they are compared with.

use image::{imageops, GrayImage, Luma, Rgb, RgbImage};

// ── Color spaces ────────────────────────────────────────────────────

/// ITU-R BT.601 luminance.
pub fn to_gray(rgb: &RgbImage) -> GrayImage {
    let mut gray = GrayImage::new(rgb.width(), rgb.height());
    for (x, y, p) in rgb.enumerate_pixels() {
        gray.put_pixel(x, y, Luma([luma(p)]));
    }
    gray
}

fn luma(p: &Rgb<u8>) -> u8 {
    (0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
        .round()
        .clamp(0.0, 255.0) as u8
}

/// Single pixel RGB → HSV (H halved into 0..180).
pub fn rgb_to_hsv(p: &Rgb<u8>) -> [u8; 3] {
    let (r, g, b) = (p[0] as f32, p[1] as f32, p[2] as f32);
    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = v - min;
    let s = if v > 0.0 { diff / v * 255.0 } else { 0.0 };
    let mut h = if diff == 0.0 {
        0.0
    } else if v == r {
        60.0 * (g - b) / diff
    } else if v == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };
    if h < 0.0 {
        h += 360.0;
    }
    [
        (h / 2.0).round().min(179.0) as u8,
        s.round().clamp(0.0, 255.0) as u8,
        v as u8,
    ]
}

/// Whole-image HSV conversion; channels of the returned buffer are H, S, V.
pub fn to_hsv(rgb: &RgbImage) -> RgbImage {
    let mut hsv = RgbImage::new(rgb.width(), rgb.height());
    for (x, y, p) in rgb.enumerate_pixels() {
        hsv.put_pixel(x, y, Rgb(rgb_to_hsv(p)));
    }
    hsv
}

/// Single pixel RGB → YCrCb.
pub fn rgb_to_ycrcb(p: &Rgb<u8>) -> [u8; 3] {
    let (r, g, b) = (p[0] as f32, p[1] as f32, p[2] as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cr = (r - y) * 0.713 + 128.0;
    let cb = (b - y) * 0.564 + 128.0;
    [
        y.round().clamp(0.0, 255.0) as u8,
        cr.round().clamp(0.0, 255.0) as u8,
        cb.round().clamp(0.0, 255.0) as u8,
    ]
}

/// Skin tone test combining HSV and YCrCb ranges.
pub fn is_skin(p: &Rgb<u8>) -> bool {
    let [h, s, v] = rgb_to_hsv(p);
    let [_, cr, cb] = rgb_to_ycrcb(p);
    h <= 20 && s >= 20 && v >= 70 && (135..=180).contains(&cr) && (85..=135).contains(&cb)
}

pub fn skin_ratio(rgb: &RgbImage) -> f64 {
    ratio(rgb.pixels(), |p| is_skin(p))
}

// ── Statistics ──────────────────────────────────────────────────────

/// Fraction of items that satisfy `pred`; 0 for an empty input.
pub fn ratio<T>(items: impl Iterator<Item = T>, mut pred: impl FnMut(&T) -> bool) -> f64 {
    let mut total = 0usize;
    let mut hits = 0usize;
    for item in items {
        total += 1;
        if pred(&item) {
            hits += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Population mean and standard deviation.
pub fn mean_std(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let mut n = 0u64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for v in values {
        n += 1;
        sum += v;
        sum_sq += v * v;
    }
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / n as f64;
    let var = (sum_sq / n as f64 - mean * mean).max(0.0);
    (mean, var.sqrt())
}

pub fn variance(values: impl Iterator<Item = f64>) -> f64 {
    let (_, std) = mean_std(values);
    std * std
}

pub fn gray_mean_std(gray: &GrayImage) -> (f64, f64) {
    mean_std(gray.pixels().map(|p| p[0] as f64))
}

/// Variance of a 3×3 Laplacian response. Low values mean blur.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let at = |x: u32, y: u32| gray.get_pixel(x, y)[0] as f64;
    let responses = (1..h - 1).flat_map(|y| {
        (1..w - 1).map(move |x| {
            at(x, y - 1) + at(x, y + 1) + at(x - 1, y) + at(x + 1, y) - 4.0 * at(x, y)
        })
    });
    variance(responses)
}

// ── Thresholding ────────────────────────────────────────────────────

/// Otsu's threshold: maximizes between-class variance of the histogram.
pub fn otsu_threshold(gray: &GrayImage) -> u8 {
    let mut hist = [0u64; 256];
    for p in gray.pixels() {
        hist[p[0] as usize] += 1;
    }
    let total = (gray.width() as u64 * gray.height() as u64) as f64;
    if total == 0.0 {
        return 127;
    }
    let sum_all: f64 = hist.iter().enumerate().map(|(i, &c)| i as f64 * c as f64).sum();

    let mut sum_back = 0.0;
    let mut weight_back = 0.0;
    let mut best = -1.0;
    let mut threshold = 0u8;
    for (t, &count) in hist.iter().enumerate() {
        weight_back += count as f64;
        if weight_back == 0.0 {
            continue;
        }
        let weight_fore = total - weight_back;
        if weight_fore == 0.0 {
            break;
        }
        sum_back += t as f64 * count as f64;
        let mean_back = sum_back / weight_back;
        let mean_fore = (sum_all - sum_back) / weight_fore;
        let between = weight_back * weight_fore * (mean_back - mean_fore).powi(2);
        if between > best {
            best = between;
            threshold = t as u8;
        }
    }
    threshold
}

/// Binary image: 255 where `value > t` (or `<= t` when `inverse`).
pub fn threshold(gray: &GrayImage, t: u8, inverse: bool) -> GrayImage {
    let mut out = GrayImage::new(gray.width(), gray.height());
    for (x, y, p) in gray.enumerate_pixels() {
        let on = (p[0] > t) != inverse;
        out.put_pixel(x, y, Luma([if on { 255 } else { 0 }]));
    }
    out
}

pub fn otsu_binarize(gray: &GrayImage, inverse: bool) -> GrayImage {
    threshold(gray, otsu_threshold(gray), inverse)
}

/// Fraction of zero-valued pixels in a binary image.
pub fn black_ratio(binary: &GrayImage) -> f64 {
    ratio(binary.pixels(), |p| p[0] == 0)
}

// ── Edges ───────────────────────────────────────────────────────────

/// Thin edge map: Sobel magnitude, non-maximum suppression, double threshold.
pub fn edges(gray: &GrayImage, low: f32, high: f32) -> GrayImage {
    let (w, h) = gray.dimensions();
    let mut out = GrayImage::new(w, h);
    if w < 3 || h < 3 {
        return out;
    }
    let idx = |x: u32, y: u32| (y * w + x) as usize;
    let at = |x: u32, y: u32| gray.get_pixel(x, y)[0] as f32;

    let mut mag = vec![0f32; (w * h) as usize];
    let mut dir = vec![0u8; (w * h) as usize];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x - 1, y)
                - at(x - 1, y + 1);
            let gy = at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x, y - 1)
                - at(x + 1, y - 1);
            mag[idx(x, y)] = gx.abs() + gy.abs();
            let angle = gy.atan2(gx).to_degrees().rem_euclid(180.0);
            dir[idx(x, y)] = match angle {
                a if !(22.5..157.5).contains(&a) => 0,
                a if a < 67.5 => 1,
                a if a < 112.5 => 2,
                _ => 3,
            };
        }
    }

    let mut strong = vec![0u8; (w * h) as usize];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let m = mag[idx(x, y)];
            if m < low {
                continue;
            }
            let (a, b) = match dir[idx(x, y)] {
                0 => (mag[idx(x - 1, y)], mag[idx(x + 1, y)]),
                1 => (mag[idx(x - 1, y - 1)], mag[idx(x + 1, y + 1)]),
                2 => (mag[idx(x, y - 1)], mag[idx(x, y + 1)]),
                _ => (mag[idx(x + 1, y - 1)], mag[idx(x - 1, y + 1)]),
            };
            if m >= a && m >= b {
                strong[idx(x, y)] = if m >= high { 2 } else { 1 };
            }
        }
    }

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let keep = match strong[idx(x, y)] {
                2 => true,
                1 => (y - 1..=y + 1)
                    .any(|ny| (x - 1..=x + 1).any(|nx| strong[idx(nx, ny)] == 2)),
                _ => false,
            };
            if keep {
                out.put_pixel(x, y, Luma([255]));
            }
        }
    }
    out
}

pub fn edge_density(gray: &GrayImage, low: f32, high: f32) -> f64 {
    ratio(edges(gray, low, high).pixels(), |p| p[0] > 0)
}

// ── Morphology & components ─────────────────────────────────────────

/// Rectangular dilation with a `kw`×`kh` kernel, applied `iterations` times.
pub fn dilate(binary: &GrayImage, kw: u32, kh: u32, iterations: u32) -> GrayImage {
    let mut current = binary.clone();
    for _ in 0..iterations {
        current = max_filter(&current, kw / 2, true);
        current = max_filter(&current, kh / 2, false);
    }
    current
}

fn max_filter(src: &GrayImage, radius: u32, horizontal: bool) -> GrayImage {
    let (w, h) = src.dimensions();
    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let (lo, hi) = if horizontal {
                (x.saturating_sub(radius), (x + radius).min(w - 1))
            } else {
                (y.saturating_sub(radius), (y + radius).min(h - 1))
            };
            let v = (lo..=hi)
                .map(|i| {
                    if horizontal {
                        src.get_pixel(i, y)[0]
                    } else {
                        src.get_pixel(x, i)[0]
                    }
                })
                .max()
                .unwrap_or(0);
            out.put_pixel(x, y, Luma([v]));
        }
    }
    out
}

/// Bounding box and pixel count of one 8-connected foreground blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Component {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
    pub area: u32,
}

impl Component {
    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    pub fn bbox_area(&self) -> u32 {
        self.width() * self.height()
    }
}

/// 8-connected components of the non-zero pixels, in scan order.
pub fn components(binary: &GrayImage) -> Vec<Component> {
    let (w, h) = binary.dimensions();
    let mut seen = vec![false; (w * h) as usize];
    let mut found = Vec::new();
    let mut stack = Vec::new();

    for sy in 0..h {
        for sx in 0..w {
            let start = (sy * w + sx) as usize;
            if seen[start] || binary.get_pixel(sx, sy)[0] == 0 {
                continue;
            }
            seen[start] = true;
            stack.push((sx, sy));
            let mut c = Component {
                min_x: sx,
                min_y: sy,
                max_x: sx,
                max_y: sy,
                area: 0,
            };
            while let Some((x, y)) = stack.pop() {
                c.area += 1;
                c.min_x = c.min_x.min(x);
                c.max_x = c.max_x.max(x);
                c.min_y = c.min_y.min(y);
                c.max_y = c.max_y.max(y);
                for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                    for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                        let i = (ny * w + nx) as usize;
                        if !seen[i] && binary.get_pixel(nx, ny)[0] > 0 {
                            seen[i] = true;
                            stack.push((nx, ny));
                        }
                    }
                }
            }
            found.push(c);
        }
    }
    found
}

// ── Regions ─────────────────────────────────────────────────────────

/// Region of interest as fractions of the image size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Roi {
    pub const fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    /// From percentage coordinates `[x, y, w, h]`.
    pub fn from_percent(box_pct: [f64; 4]) -> Self {
        Self::new(
            box_pct[0] / 100.0,
            box_pct[1] / 100.0,
            box_pct[2] / 100.0,
            box_pct[3] / 100.0,
        )
    }

    /// Pixel rectangle clipped to `width`×`height`.
    pub fn to_pixels(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let x = ((self.x * width as f64) as u32).min(width);
        let y = ((self.y * height as f64) as u32).min(height);
        let w = ((self.w * width as f64) as u32).min(width - x);
        let h = ((self.h * height as f64) as u32).min(height - y);
        (x, y, w, h)
    }
}

pub fn crop_rgb(rgb: &RgbImage, roi: Roi) -> RgbImage {
    let (x, y, w, h) = roi.to_pixels(rgb.width(), rgb.height());
    imageops::crop_imm(rgb, x, y, w, h).to_image()
}

pub fn crop_gray(gray: &GrayImage, roi: Roi) -> GrayImage {
    let (x, y, w, h) = roi.to_pixels(gray.width(), gray.height());
    imageops::crop_imm(gray, x, y, w, h).to_image()
}

// ── Geometry ────────────────────────────────────────────────────────

/// Rotate around the center by `degrees` (counter-clockwise), replicating borders.
pub fn rotate_bilinear(rgb: &RgbImage, degrees: f64) -> RgbImage {
    let (w, h) = rgb.dimensions();
    let mut out = RgbImage::new(w, h);
    if w == 0 || h == 0 {
        return out;
    }
    let (sin, cos) = degrees.to_radians().sin_cos();
    let (cx, cy) = (w as f64 / 2.0, h as f64 / 2.0);
    let max_x = (w - 1) as f64;
    let max_y = (h - 1) as f64;

    for y in 0..h {
        for x in 0..w {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let sx = (cos * dx - sin * dy + cx).clamp(0.0, max_x);
            let sy = (sin * dx + cos * dy + cy).clamp(0.0, max_y);
            let (x0, y0) = (sx.floor() as u32, sy.floor() as u32);
            let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
            let (fx, fy) = (sx - x0 as f64, sy - y0 as f64);
            let mut px = [0u8; 3];
            for (c, slot) in px.iter_mut().enumerate() {
                let top = rgb.get_pixel(x0, y0)[c] as f64 * (1.0 - fx)
                    + rgb.get_pixel(x1, y0)[c] as f64 * fx;
                let bottom = rgb.get_pixel(x0, y1)[c] as f64 * (1.0 - fx)
                    + rgb.get_pixel(x1, y1)[c] as f64 * fx;
                *slot = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
            }
            out.put_pixel(x, y, Rgb(px));
        }
    }
    out
}

/// Contrast-limited adaptive histogram equalization on a grayscale image.
pub fn clahe(gray: &GrayImage, clip_limit: f64, tiles_x: u32, tiles_y: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w < tiles_x || h < tiles_y {
        return gray.clone();
    }
    let tile_w = w.div_ceil(tiles_x);
    let tile_h = h.div_ceil(tiles_y);

    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);
            let mut hist = [0u32; 256];
            let mut count = 0u32;
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y)[0] as usize] += 1;
                    count += 1;
                }
            }
            if count == 0 {
                continue;
            }
            let limit = ((clip_limit * count as f64 / 256.0) as u32).max(1);
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > limit {
                    excess += *bin - limit;
                    *bin = limit;
                }
            }
            let bonus = excess / 256;
            let remainder = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += bonus + u32::from(i < remainder);
            }
            let lut = &mut luts[(ty * tiles_x + tx) as usize];
            let mut cdf = 0u32;
            for (i, bin) in hist.iter().enumerate() {
                cdf += bin;
                lut[i] = ((cdf as f64 * 255.0 / count as f64).round()).min(255.0) as u8;
            }
        }
    }

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        let gy = (y as f64 + 0.5) / tile_h as f64 - 0.5;
        let ty0 = gy.floor().clamp(0.0, (tiles_y - 1) as f64) as u32;
        let ty1 = (ty0 + 1).min(tiles_y - 1);
        let fy = (gy - ty0 as f64).clamp(0.0, 1.0);
        for x in 0..w {
            let gx = (x as f64 + 0.5) / tile_w as f64 - 0.5;
            let tx0 = gx.floor().clamp(0.0, (tiles_x - 1) as f64) as u32;
            let tx1 = (tx0 + 1).min(tiles_x - 1);
            let fx = (gx - tx0 as f64).clamp(0.0, 1.0);
            let v = gray.get_pixel(x, y)[0] as usize;
            let lut = |tx: u32, ty: u32| luts[(ty * tiles_x + tx) as usize][v] as f64;
            let top = lut(tx0, ty0) * (1.0 - fx) + lut(tx1, ty0) * fx;
            let bottom = lut(tx0, ty1) * (1.0 - fx) + lut(tx1, ty1) * fx;
            out.put_pixel(x, y, Luma([(top * (1.0 - fy) + bottom * fy).round() as u8]));
        }
    }
    out
}
