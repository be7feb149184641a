//! Raster primitives used to draw shapes onto an RGBA surface.

use std::f64::consts::PI;

use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{Rgba, RgbaImage};

use crate::models::{Color, Shape, ShapeKind};

/// Opacity applied to highlight fills.
pub const HIGHLIGHT_ALPHA: u8 = 77;

const GLYPH_SIZE: i32 = 8;
/// Largest glyph scale a label is drawn at, whatever its stroke width.
pub const MAX_GLYPH_SCALE: u32 = 64;

pub fn to_rgba(color: Color) -> Rgba<u8> {
    Rgba([color.r, color.g, color.b, color.a])
}

/// Draws one shape. Two-point kinds only read the first and last point.
pub fn draw_shape(img: &mut RgbaImage, shape: &Shape) {
    let color = to_rgba(shape.color);
    let width = shape.stroke_width.max(1.0);
    match shape.kind {
        ShapeKind::Arrow => {
            let Some((start, end)) = shape.endpoints() else {
                return;
            };
            let head_len = (width * 4.0).max(10.0);
            let head_width = (width * 3.0).max(8.0);
            draw_arrow(img, (start.x, start.y), (end.x, end.y), color, width, head_len, head_width);
        }
        ShapeKind::Rectangle => {
            let Some((start, end)) = shape.endpoints() else {
                return;
            };
            stroke_rect(img, (start.x, start.y), (end.x, end.y), color, width);
        }
        ShapeKind::Highlight => {
            let Some((start, end)) = shape.endpoints() else {
                return;
            };
            let fill = Rgba([color[0], color[1], color[2], HIGHLIGHT_ALPHA]);
            fill_rect(
                img,
                start.x.min(end.x).round() as i32,
                start.y.min(end.y).round() as i32,
                start.x.max(end.x).round() as i32,
                start.y.max(end.y).round() as i32,
                fill,
            );
        }
        ShapeKind::Freehand => match shape.points.as_slice() {
            [] => {}
            [only] => draw_disc(img, only.x, only.y, width / 2.0, color),
            points => {
                for pair in points.windows(2) {
                    draw_thick_line(img, (pair[0].x, pair[0].y), (pair[1].x, pair[1].y), color, width);
                }
            }
        },
        ShapeKind::TextLabel => {
            let (Some(anchor), Some(text)) = (shape.points.first(), shape.text.as_deref()) else {
                return;
            };
            draw_text_label(img, anchor.x.round() as i32, anchor.y.round() as i32, text, shape.color, width);
        }
    }
}

fn clamp_i32(value: i32, min_value: i32, max_value: i32) -> i32 {
    value.max(min_value).min(max_value)
}

pub fn blend_pixel(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let a = f64::from(src[3]) / 255.0;
    if a <= 0.0 {
        return dst;
    }
    let inv = 1.0 - a;
    let mix = |d: u8, s: u8| (f64::from(d) * inv + f64::from(s) * a).round().clamp(0.0, 255.0) as u8;
    let out_a = (f64::from(dst[3]) * inv + f64::from(src[3])).round().clamp(0.0, 255.0) as u8;
    Rgba([mix(dst[0], src[0]), mix(dst[1], src[1]), mix(dst[2], src[2]), out_a])
}

fn blend_at(img: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>) {
    if x < 0 || y < 0 || x >= img.width() as i32 || y >= img.height() as i32 {
        return;
    }
    let dst = *img.get_pixel(x as u32, y as u32);
    img.put_pixel(x as u32, y as u32, blend_pixel(dst, color));
}

fn draw_disc(img: &mut RgbaImage, cx: f64, cy: f64, radius: f64, color: Rgba<u8>) {
    if img.width() == 0 || img.height() == 0 {
        return;
    }
    if radius <= 0.5 {
        blend_at(img, cx.round() as i32, cy.round() as i32, color);
        return;
    }
    let min_x = clamp_i32((cx - radius).floor() as i32, 0, img.width() as i32 - 1);
    let max_x = clamp_i32((cx + radius).ceil() as i32, 0, img.width() as i32 - 1);
    let min_y = clamp_i32((cy - radius).floor() as i32, 0, img.height() as i32 - 1);
    let max_y = clamp_i32((cy + radius).ceil() as i32, 0, img.height() as i32 - 1);
    let r2 = radius * radius;
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let dx = f64::from(x) - cx;
            let dy = f64::from(y) - cy;
            if dx * dx + dy * dy <= r2 {
                blend_at(img, x, y, color);
            }
        }
    }
}

/// Strokes a segment with round caps. Overlapping stamps are painted once per
/// pixel so translucent strokes keep a uniform opacity.
fn draw_thick_line(img: &mut RgbaImage, from: (f64, f64), to: (f64, f64), color: Rgba<u8>, width: f64) {
    if img.width() == 0 || img.height() == 0 {
        return;
    }
    let radius = (width / 2.0).max(0.6);
    let (x1, y1) = from;
    let (x2, y2) = to;
    let min_x = clamp_i32((x1.min(x2) - radius).floor() as i32, 0, img.width() as i32 - 1);
    let max_x = clamp_i32((x1.max(x2) + radius).ceil() as i32, 0, img.width() as i32 - 1);
    let min_y = clamp_i32((y1.min(y2) - radius).floor() as i32, 0, img.height() as i32 - 1);
    let max_y = clamp_i32((y1.max(y2) + radius).ceil() as i32, 0, img.height() as i32 - 1);
    let r2 = radius * radius;
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let p = (f64::from(x), f64::from(y));
            if distance_to_segment_sq(p, from, to) <= r2 {
                blend_at(img, x, y, color);
            }
        }
    }
}

fn distance_to_segment_sq(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq <= f64::EPSILON {
        0.0
    } else {
        (((p.0 - a.0) * dx + (p.1 - a.1) * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (cx, cy) = (a.0 + dx * t, a.1 + dy * t);
    (p.0 - cx).powi(2) + (p.1 - cy).powi(2)
}

fn triangle_area(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    ((a.0 * (b.1 - c.1) + b.0 * (c.1 - a.1) + c.0 * (a.1 - b.1)).abs()) / 2.0
}

fn point_in_triangle(p: (f64, f64), a: (f64, f64), b: (f64, f64), c: (f64, f64), eps: f64) -> bool {
    let total = triangle_area(a, b, c);
    if total <= eps {
        return false;
    }
    let a1 = triangle_area(p, b, c);
    let a2 = triangle_area(a, p, c);
    let a3 = triangle_area(a, b, p);
    (a1 + a2 + a3 - total).abs() <= eps
}

fn fill_triangle(img: &mut RgbaImage, a: (f64, f64), b: (f64, f64), c: (f64, f64), color: Rgba<u8>) {
    if img.width() == 0 || img.height() == 0 {
        return;
    }
    let min_x = clamp_i32(a.0.min(b.0).min(c.0).floor() as i32, 0, img.width() as i32 - 1);
    let max_x = clamp_i32(a.0.max(b.0).max(c.0).ceil() as i32, 0, img.width() as i32 - 1);
    let min_y = clamp_i32(a.1.min(b.1).min(c.1).floor() as i32, 0, img.height() as i32 - 1);
    let max_y = clamp_i32(a.1.max(b.1).max(c.1).ceil() as i32, 0, img.height() as i32 - 1);
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let p = (f64::from(x) + 0.5, f64::from(y) + 0.5);
            if point_in_triangle(p, a, b, c, 0.8) {
                blend_at(img, x, y, color);
            }
        }
    }
}

fn draw_arrow(
    img: &mut RgbaImage,
    from: (f64, f64),
    to: (f64, f64),
    color: Rgba<u8>,
    width: f64,
    head_len: f64,
    head_width: f64,
) {
    let angle = (to.1 - from.1).atan2(to.0 - from.0);
    // A short arrow is all head; the shaft never extends behind `from`.
    let head_len = head_len.min((to.0 - from.0).hypot(to.1 - from.1));
    let back = (to.0 - head_len * angle.cos(), to.1 - head_len * angle.sin());
    draw_thick_line(img, from, back, color, width);

    let left_angle = angle + PI / 2.0;
    let right_angle = angle - PI / 2.0;
    let left = (
        back.0 + (head_width / 2.0) * left_angle.cos(),
        back.1 + (head_width / 2.0) * left_angle.sin(),
    );
    let right = (
        back.0 + (head_width / 2.0) * right_angle.cos(),
        back.1 + (head_width / 2.0) * right_angle.sin(),
    );
    fill_triangle(img, to, left, right, color);
}

fn stroke_rect(img: &mut RgbaImage, a: (f64, f64), b: (f64, f64), color: Rgba<u8>, width: f64) {
    let (x0, y0) = (a.0.min(b.0), a.1.min(b.1));
    let (x1, y1) = (a.0.max(b.0), a.1.max(b.1));
    let half = (width / 2.0).max(0.5);
    // Four bands around the edges; corners are covered by the horizontal bands.
    fill_rect_f(img, x0 - half, y0 - half, x1 + half, y0 + half, color);
    fill_rect_f(img, x0 - half, y1 - half, x1 + half, y1 + half, color);
    fill_rect_f(img, x0 - half, y0 + half, x0 + half, y1 - half, color);
    fill_rect_f(img, x1 - half, y0 + half, x1 + half, y1 - half, color);
}

fn fill_rect_f(img: &mut RgbaImage, x0: f64, y0: f64, x1: f64, y1: f64, color: Rgba<u8>) {
    if x1 <= x0 || y1 <= y0 {
        return;
    }
    fill_rect(
        img,
        x0.round() as i32,
        y0.round() as i32,
        x1.round() as i32 - 1,
        y1.round() as i32 - 1,
        color,
    );
}

/// Fills the inclusive pixel box `(x0, y0)..=(x1, y1)`.
pub fn fill_rect(img: &mut RgbaImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgba<u8>) {
    if img.width() == 0 || img.height() == 0 {
        return;
    }
    let (lo_x, hi_x) = (x0.min(x1), x0.max(x1));
    let (lo_y, hi_y) = (y0.min(y1), y0.max(y1));
    if hi_x < 0 || hi_y < 0 || lo_x >= img.width() as i32 || lo_y >= img.height() as i32 {
        return;
    }
    let min_x = clamp_i32(lo_x, 0, img.width() as i32 - 1);
    let max_x = clamp_i32(hi_x, 0, img.width() as i32 - 1);
    let min_y = clamp_i32(lo_y, 0, img.height() as i32 - 1);
    let max_y = clamp_i32(hi_y, 0, img.height() as i32 - 1);
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            blend_at(img, x, y, color);
        }
    }
}

/// Glyph scale for a text label drawn with the given stroke width.
pub fn glyph_scale(stroke_width: f64) -> u32 {
    (stroke_width / 2.0).round().clamp(2.0, f64::from(MAX_GLYPH_SCALE)) as u32
}

/// Measured size of `text` in pixels at `scale`.
pub fn text_size(text: &str, scale: u32) -> (i32, i32) {
    let scale_i = scale.max(1) as i32;
    let lines: Vec<&str> = text.split('\n').collect();
    let width_chars = lines
        .iter()
        .map(|line| line.chars().count() as i32)
        .max()
        .unwrap_or(0);
    let line_count = lines.len().max(1) as i32;
    let cell = GLYPH_SIZE * scale_i;
    (width_chars.saturating_mul(cell), line_count.saturating_mul(cell))
}

fn draw_text_label(img: &mut RgbaImage, x: i32, y: i32, text: &str, color: Color, stroke_width: f64) {
    let scale = glyph_scale(stroke_width);
    let padding = 2 * scale as i32;
    let (w, h) = text_size(text, scale);
    let plate = if color.luma() > 0.6 { Color::BLACK } else { Color::WHITE };
    fill_rect(
        img,
        x.saturating_sub(padding),
        y.saturating_sub(padding),
        x.saturating_add(w).saturating_add(padding - 1),
        y.saturating_add(h).saturating_add(padding - 1),
        to_rgba(plate),
    );
    draw_bitmap_text(img, x, y, text, to_rgba(color), scale);
}

fn draw_bitmap_text(img: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>, scale: u32) {
    let scale_i = scale.clamp(1, MAX_GLYPH_SCALE) as i32;
    let cell = GLYPH_SIZE * scale_i;
    let (img_w, img_h) = (img.width() as i32, img.height() as i32);
    let mut cursor_x = x;
    let mut cursor_y = y;
    for ch in text.chars() {
        if ch == '\n' {
            cursor_x = x;
            cursor_y = cursor_y.saturating_add(cell);
            continue;
        }
        let advance = cursor_x.saturating_add(cell);
        let off_canvas = advance <= 0 || cursor_x >= img_w || cursor_y >= img_h || cursor_y.saturating_add(cell) <= 0;
        if off_canvas {
            cursor_x = advance;
            continue;
        }
        let Some(glyph) = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) else {
            cursor_x = advance;
            continue;
        };
        for (row_idx, row) in glyph.iter().enumerate() {
            for col_idx in 0..GLYPH_SIZE {
                if (*row >> col_idx) & 1 == 0 {
                    continue;
                }
                let px = cursor_x + col_idx * scale_i;
                let py = cursor_y + row_idx as i32 * scale_i;
                for sy in 0..scale_i {
                    for sx in 0..scale_i {
                        blend_at(img, px + sx, py + sy, color);
                    }
                }
            }
        }
        cursor_x = advance;
    }
}
