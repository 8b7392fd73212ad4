//! Annotated rendering of aggregate records

use crate::region::RegionOfInterest;
use crate::types::{FallDetection, FireSmokeClass, FireSmokeDetection, PersonDetection, Rect};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_polygon_mut, draw_hollow_rect_mut};
use imageproc::point::Point;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const REGION_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const FIRE_COLOR: Rgb<u8> = Rgb([220, 40, 20]);
const SMOKE_COLOR: Rgb<u8> = Rgb([120, 120, 120]);

const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;

/// 5x7 bitmap glyphs for the characters used in labels
fn glyph(ch: char) -> [u8; 7] {
    match ch {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '%' => [0x18, 0x19, 0x02, 0x04, 0x08, 0x13, 0x03],
        ' ' => [0x00; 7],
        _ => [0x1F, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1F],
    }
}

fn put_clipped(img: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}

/// Draw `text` with its top-left corner at (`x`, `y`), optionally on a filled background
pub fn draw_text(
    img: &mut RgbImage,
    text: &str,
    x: i32,
    y: i32,
    color: Rgb<u8>,
    bg_color: Option<Rgb<u8>>,
) {
    if let Some(bg) = bg_color {
        let width = text.chars().count() as i32 * (GLYPH_WIDTH + 1) + 1;
        for dy in 0..GLYPH_HEIGHT + 2 {
            for dx in 0..width {
                put_clipped(img, x + dx, y + dy, bg);
            }
        }
    }

    for (i, ch) in text.to_uppercase().chars().enumerate() {
        let origin_x = x + 1 + i as i32 * (GLYPH_WIDTH + 1);
        for (row, bits) in glyph(ch).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if (bits >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                    put_clipped(img, origin_x + col, y + 1 + row as i32, color);
                }
            }
        }
    }
}

/// Rectangle outline `thickness` pixels wide, growing outwards
pub fn draw_rect(img: &mut RgbImage, rect: &Rect, color: Rgb<u8>, thickness: i32) {
    let width = rect.width.max(1.0) as u32;
    let height = rect.height.max(1.0) as u32;
    for offset in 0..thickness.max(1) {
        let outline = imageproc::rect::Rect::at(rect.x as i32 - offset, rect.y as i32 - offset)
            .of_size(width + (offset * 2) as u32, height + (offset * 2) as u32);
        draw_hollow_rect_mut(img, outline, color);
    }
}

/// Deterministic, reasonably dark color per track id
pub fn track_color(track_id: i32) -> Rgb<u8> {
    let mut hash = (track_id as u32).wrapping_mul(2654435761);
    let r = (hash & 0xFF) as u16;
    hash = hash.wrapping_mul(2654435761);
    let g = (hash & 0xFF) as u16;
    hash = hash.wrapping_mul(2654435761);
    let b = (hash & 0xFF) as u16;

    let clamp = |c: u16, dominant: bool| c.min(180).max(if dominant { 100 } else { 40 });
    Rgb([
        clamp(r, r > g && r > b) as u8,
        clamp(g, g > r && g > b) as u8,
        clamp(b, b > r && b > g) as u8,
    ])
}

fn labelled_box(img: &mut RgbImage, rect: &Rect, label: &str, color: Rgb<u8>) {
    draw_rect(img, rect, color, 1);
    draw_text(img, label, rect.x as i32, rect.y as i32, WHITE, Some(color));
}

pub fn annotate_persons(img: &mut RgbImage, persons: &[PersonDetection]) {
    for person in persons {
        let label = person.track_id.to_string();
        labelled_box(img, &person.bbox, &label, track_color(person.track_id));
    }
}

pub fn annotate_falls(img: &mut RgbImage, falls: &[FallDetection]) {
    for fall in falls {
        let label = format!("FALL {}", fall.track_id);
        labelled_box(img, &fall.bbox, &label, track_color(fall.track_id));
    }
}

pub fn annotate_fire_smoke(img: &mut RgbImage, detections: &[FireSmokeDetection]) {
    for det in detections {
        let color = match det.class {
            FireSmokeClass::Fire => FIRE_COLOR,
            FireSmokeClass::Smoke => SMOKE_COLOR,
        };
        let label = format!("{} {:.0}%", det.class.label(), det.confidence * 100.0);
        labelled_box(img, &det.bbox, &label, color);
    }
}

/// Region outline plus the person count in the top-left corner
pub fn annotate_region(img: &mut RgbImage, region: &RegionOfInterest, count: usize) {
    if region.is_valid() {
        let mut points: Vec<Point<f32>> = region
            .points()
            .iter()
            .map(|&(x, y)| Point::new(x, y))
            .collect();
        // imageproc closes the outline itself
        if points.len() > 3 && points.first() == points.last() {
            points.pop();
        }
        draw_hollow_polygon_mut(img, &points, REGION_COLOR);
    }
    draw_text(img, &format!("Count: {}", count), 10, 10, WHITE, Some(Rgb([0, 0, 0])));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draw_text_is_clipped() {
        let mut img = RgbImage::new(8, 8);
        draw_text(&mut img, "fire 99%", -3, 4, WHITE, Some(Rgb([1, 2, 3])));
        assert_eq!(*img.get_pixel(0, 4), Rgb([1, 2, 3]));
    }

    #[test]
    fn test_draw_rect_outline() {
        let mut img = RgbImage::new(20, 20);
        draw_rect(&mut img, &Rect::new(5.0, 5.0, 6.0, 6.0), Rgb([9, 9, 9]), 2);
        assert_eq!(*img.get_pixel(5, 5), Rgb([9, 9, 9]));
        assert_eq!(*img.get_pixel(4, 4), Rgb([9, 9, 9]));
        assert_eq!(*img.get_pixel(8, 8), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_track_color_is_deterministic() {
        assert_eq!(track_color(7), track_color(7));
        let Rgb([r, g, b]) = track_color(3);
        assert!(r <= 180 && g <= 180 && b <= 180);
    }
}
