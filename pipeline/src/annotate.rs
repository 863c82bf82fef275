//! Box and label overlay for detection frames.
//!
//! Text is drawn with a built-in 5x7 bitmap font so no font files are needed
//! at runtime. Lowercase is rendered as uppercase.

use image::{Rgb, RgbImage};
use roadwatch_common::detection::Detection;

const GLYPH_W: i32 = 5;
const GLYPH_H: i32 = 7;
const BOX_THICKNESS: i32 = 2;
const LABEL_BG: Rgb<u8> = Rgb([0, 0, 0]);

/// Confidence tier colour shared by the overlay and the JSON reports.
pub fn confidence_color(confidence: f32) -> Rgb<u8> {
    if confidence >= 0.8 {
        Rgb([0, 255, 0])
    } else if confidence >= 0.5 {
        Rgb([255, 255, 0])
    } else {
        Rgb([255, 0, 0])
    }
}

pub fn confidence_hex(confidence: f32) -> String {
    let Rgb([r, g, b]) = confidence_color(confidence);
    format!("#{r:02X}{g:02X}{b:02X}")
}

/// Draw every detection onto a copy of `frame`.
pub fn annotate(frame: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut out = frame.clone();
    if out.width() == 0 || out.height() == 0 {
        return out;
    }
    let scale = (out.height() as i32 / 360).max(1);

    for det in detections {
        let color = confidence_color(det.confidence);
        let b = det.bbox.clamped(out.width(), out.height());
        let (x1, y1) = (b.x1.round() as i32, b.y1.round() as i32);
        let (x2, y2) = (b.x2.round() as i32 - 1, b.y2.round() as i32 - 1);
        for t in 0..BOX_THICKNESS * scale {
            outline(&mut out, x1 + t, y1 + t, x2 - t, y2 - t, color);
        }
    }

    // Labels go in a second pass so they sit above neighbouring boxes.
    for det in detections {
        let color = confidence_color(det.confidence);
        let text = det.label();
        let b = det.bbox.clamped(out.width(), out.height());
        let text_w = text.chars().count() as i32 * (GLYPH_W + 1) * scale;
        let text_h = (GLYPH_H + 2) * scale;
        let x = b.x1.round() as i32;
        let mut y = b.y1.round() as i32 - text_h;
        if y < 0 {
            y = b.y1.round() as i32;
        }
        fill(&mut out, x, y, x + text_w, y + text_h, LABEL_BG);
        draw_text(&mut out, x + scale, y + scale, &text, scale, color);
    }

    out
}

fn put(img: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}

fn outline(img: &mut RgbImage, x1: i32, y1: i32, x2: i32, y2: i32, color: Rgb<u8>) {
    if x2 < x1 || y2 < y1 {
        return;
    }
    for x in x1..=x2 {
        put(img, x, y1, color);
        put(img, x, y2, color);
    }
    for y in y1..=y2 {
        put(img, x1, y, color);
        put(img, x2, y, color);
    }
}

fn fill(img: &mut RgbImage, x1: i32, y1: i32, x2: i32, y2: i32, color: Rgb<u8>) {
    let x1 = x1.max(0);
    let y1 = y1.max(0);
    let x2 = x2.min(img.width() as i32);
    let y2 = y2.min(img.height() as i32);
    for y in y1..y2 {
        for x in x1..x2 {
            img.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_text(img: &mut RgbImage, x: i32, y: i32, text: &str, scale: i32, color: Rgb<u8>) {
    let advance = (GLYPH_W + 1) * scale;
    for (i, ch) in text.chars().flat_map(char::to_uppercase).enumerate() {
        let origin = x + i as i32 * advance;
        for (row, bits) in glyph(ch).iter().enumerate() {
            for col in 0..GLYPH_W {
                if bits & (1 << (GLYPH_W - 1 - col)) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        put(
                            img,
                            origin + col * scale + dx,
                            y + row as i32 * scale + dy,
                            color,
                        );
                    }
                }
            }
        }
    }
}

/// Row bitmaps, most significant of the low five bits is the leftmost column.
fn glyph(ch: char) -> [u8; 7] {
    match ch {
        'A' => [14, 17, 17, 31, 17, 17, 17],
        'B' => [30, 17, 17, 30, 17, 17, 30],
        'C' => [14, 17, 16, 16, 16, 17, 14],
        'D' => [28, 18, 17, 17, 17, 18, 28],
        'E' => [31, 16, 16, 30, 16, 16, 31],
        'F' => [31, 16, 16, 30, 16, 16, 16],
        'G' => [14, 17, 16, 23, 17, 17, 15],
        'H' => [17, 17, 17, 31, 17, 17, 17],
        'I' => [14, 4, 4, 4, 4, 4, 14],
        'J' => [7, 2, 2, 2, 2, 18, 12],
        'K' => [17, 18, 20, 24, 20, 18, 17],
        'L' => [16, 16, 16, 16, 16, 16, 31],
        'M' => [17, 27, 21, 21, 17, 17, 17],
        'N' => [17, 17, 25, 21, 19, 17, 17],
        'O' => [14, 17, 17, 17, 17, 17, 14],
        'P' => [30, 17, 17, 30, 16, 16, 16],
        'Q' => [14, 17, 17, 17, 21, 18, 13],
        'R' => [30, 17, 17, 30, 20, 18, 17],
        'S' => [15, 16, 16, 14, 1, 1, 30],
        'T' => [31, 4, 4, 4, 4, 4, 4],
        'U' => [17, 17, 17, 17, 17, 17, 14],
        'V' => [17, 17, 17, 17, 17, 10, 4],
        'W' => [17, 17, 17, 21, 21, 21, 10],
        'X' => [17, 17, 10, 4, 10, 17, 17],
        'Y' => [17, 17, 10, 4, 4, 4, 4],
        'Z' => [31, 1, 2, 4, 8, 16, 31],
        '0' => [14, 17, 19, 21, 25, 17, 14],
        '1' => [4, 12, 4, 4, 4, 4, 14],
        '2' => [14, 17, 1, 2, 4, 8, 31],
        '3' => [31, 2, 4, 2, 1, 17, 14],
        '4' => [2, 6, 10, 18, 31, 2, 2],
        '5' => [31, 16, 30, 1, 1, 17, 14],
        '6' => [6, 8, 16, 30, 17, 17, 14],
        '7' => [31, 1, 2, 4, 8, 8, 8],
        '8' => [14, 17, 17, 14, 17, 17, 14],
        '9' => [14, 17, 17, 15, 1, 2, 12],
        '.' => [0, 0, 0, 0, 0, 12, 12],
        '-' => [0, 0, 0, 31, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 31],
        ' ' => [0; 7],
        _ => [31, 17, 17, 17, 17, 17, 31],
    }
}
