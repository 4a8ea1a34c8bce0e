use image::{Rgb, RgbImage};
use serde::Deserialize;

use crate::common::PixelFormat;

const GLYPH_WIDTH: i64 = 8;
const GLYPH_HEIGHT: usize = 12;
/// Rows above the baseline; the last two rows hold descenders.
const GLYPH_ASCENT: i64 = 10;

/// How overlay text is drawn.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TextStyle {
    /// Left end of the text baseline, in pixels.
    pub anchor: (u32, u32),
    /// RGB, rearranged to the frame's channel order when drawn.
    pub color: [u8; 3],
    pub scale: u32,
    pub thickness: u32,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            anchor: (10, 30),
            color: [0, 0, 255],
            scale: 2,
            thickness: 1,
        }
    }
}

/// Draws `text` in an 8x12 bitmap font. Pixels outside the image are clipped.
pub fn draw_text(image: &mut RgbImage, text: &str, style: &TextStyle, format: PixelFormat) {
    let scale = i64::from(style.scale.max(1));
    let stroke = scale + i64::from(style.thickness.max(1)) - 1;
    let color = Rgb(format.arrange(style.color));
    let (width, height) = (i64::from(image.width()), i64::from(image.height()));
    let top = i64::from(style.anchor.1) - GLYPH_ASCENT * scale;
    let mut left = i64::from(style.anchor.0);

    for ch in text.chars() {
        if left >= width {
            break;
        }
        let rows = glyph(ch);
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if (bits >> (7 - col)) & 1 == 0 {
                    continue;
                }
                let x0 = left + col * scale;
                let y0 = top + row as i64 * scale;
                for y in y0.max(0)..(y0 + stroke).min(height) {
                    for x in x0.max(0)..(x0 + stroke).min(width) {
                        image.put_pixel(x as u32, y as u32, color);
                    }
                }
            }
        }
        left += GLYPH_WIDTH * scale;
    }
}

fn glyph(ch: char) -> [u8; GLYPH_HEIGHT] {
    match ch {
        'A' => [0x00, 0x18, 0x24, 0x42, 0x42, 0x7E, 0x42, 0x42, 0x42, 0x42, 0x00, 0x00],
        'B' => [0x00, 0x7C, 0x42, 0x42, 0x7C, 0x42, 0x42, 0x42, 0x42, 0x7C, 0x00, 0x00],
        'C' => [0x00, 0x3C, 0x42, 0x40, 0x40, 0x40, 0x40, 0x40, 0x42, 0x3C, 0x00, 0x00],
        'D' => [0x00, 0x78, 0x44, 0x42, 0x42, 0x42, 0x42, 0x42, 0x44, 0x78, 0x00, 0x00],
        'E' => [0x00, 0x7E, 0x40, 0x40, 0x40, 0x7C, 0x40, 0x40, 0x40, 0x7E, 0x00, 0x00],
        'F' => [0x00, 0x7E, 0x40, 0x40, 0x40, 0x7C, 0x40, 0x40, 0x40, 0x40, 0x00, 0x00],
        'G' => [0x00, 0x3C, 0x42, 0x40, 0x40, 0x4E, 0x42, 0x42, 0x46, 0x3A, 0x00, 0x00],
        'H' => [0x00, 0x42, 0x42, 0x42, 0x42, 0x7E, 0x42, 0x42, 0x42, 0x42, 0x00, 0x00],
        'I' => [0x00, 0x3E, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x3E, 0x00, 0x00],
        'J' => [0x00, 0x1E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x44, 0x44, 0x38, 0x00, 0x00],
        'K' => [0x00, 0x42, 0x44, 0x48, 0x50, 0x60, 0x50, 0x48, 0x44, 0x42, 0x00, 0x00],
        'L' => [0x00, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x7E, 0x00, 0x00],
        'M' => [0x00, 0x42, 0x66, 0x5A, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x00, 0x00],
        'N' => [0x00, 0x42, 0x62, 0x52, 0x4A, 0x46, 0x42, 0x42, 0x42, 0x42, 0x00, 0x00],
        'O' => [0x00, 0x3C, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x3C, 0x00, 0x00],
        'P' => [0x00, 0x7C, 0x42, 0x42, 0x42, 0x7C, 0x40, 0x40, 0x40, 0x40, 0x00, 0x00],
        'Q' => [0x00, 0x3C, 0x42, 0x42, 0x42, 0x42, 0x4A, 0x44, 0x44, 0x3A, 0x00, 0x00],
        'R' => [0x00, 0x7C, 0x42, 0x42, 0x42, 0x7C, 0x48, 0x44, 0x42, 0x42, 0x00, 0x00],
        'S' => [0x00, 0x3C, 0x42, 0x40, 0x30, 0x0C, 0x02, 0x42, 0x42, 0x3C, 0x00, 0x00],
        'T' => [0x00, 0x7F, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x00, 0x00],
        'U' => [0x00, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x3C, 0x00, 0x00],
        'V' => [0x00, 0x42, 0x42, 0x42, 0x42, 0x24, 0x24, 0x24, 0x18, 0x18, 0x00, 0x00],
        'W' => [0x00, 0x42, 0x42, 0x42, 0x42, 0x42, 0x5A, 0x5A, 0x66, 0x42, 0x00, 0x00],
        'X' => [0x00, 0x42, 0x42, 0x24, 0x18, 0x18, 0x24, 0x42, 0x42, 0x42, 0x00, 0x00],
        'Y' => [0x00, 0x41, 0x22, 0x14, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x00, 0x00],
        'Z' => [0x00, 0x7E, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x40, 0x7E, 0x00, 0x00],
        'a' => [0x00, 0x00, 0x00, 0x3C, 0x02, 0x3E, 0x42, 0x42, 0x46, 0x3A, 0x00, 0x00],
        'b' => [0x00, 0x40, 0x40, 0x5C, 0x62, 0x42, 0x42, 0x42, 0x62, 0x5C, 0x00, 0x00],
        'c' => [0x00, 0x00, 0x00, 0x3C, 0x42, 0x40, 0x40, 0x40, 0x42, 0x3C, 0x00, 0x00],
        'd' => [0x00, 0x02, 0x02, 0x3A, 0x46, 0x42, 0x42, 0x42, 0x46, 0x3A, 0x00, 0x00],
        'e' => [0x00, 0x00, 0x00, 0x3C, 0x42, 0x7E, 0x40, 0x40, 0x42, 0x3C, 0x00, 0x00],
        'f' => [0x00, 0x0C, 0x10, 0x10, 0x7C, 0x10, 0x10, 0x10, 0x10, 0x10, 0x00, 0x00],
        'g' => [0x00, 0x00, 0x00, 0x3A, 0x46, 0x42, 0x46, 0x3A, 0x02, 0x3C, 0x00, 0x00],
        'h' => [0x00, 0x40, 0x40, 0x5C, 0x62, 0x42, 0x42, 0x42, 0x42, 0x42, 0x00, 0x00],
        'i' => [0x00, 0x08, 0x00, 0x18, 0x08, 0x08, 0x08, 0x08, 0x08, 0x3E, 0x00, 0x00],
        'j' => [0x00, 0x04, 0x00, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x44, 0x38, 0x00, 0x00],
        'k' => [0x00, 0x40, 0x40, 0x44, 0x48, 0x70, 0x48, 0x44, 0x42, 0x41, 0x00, 0x00],
        'l' => [0x00, 0x18, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x3E, 0x00, 0x00],
        'm' => [0x00, 0x00, 0x00, 0x76, 0x49, 0x49, 0x49, 0x49, 0x49, 0x49, 0x00, 0x00],
        'n' => [0x00, 0x00, 0x00, 0x5C, 0x62, 0x42, 0x42, 0x42, 0x42, 0x42, 0x00, 0x00],
        'o' => [0x00, 0x00, 0x00, 0x3C, 0x42, 0x42, 0x42, 0x42, 0x42, 0x3C, 0x00, 0x00],
        'p' => [0x00, 0x00, 0x00, 0x5C, 0x62, 0x42, 0x62, 0x5C, 0x40, 0x40, 0x00, 0x00],
        'q' => [0x00, 0x00, 0x00, 0x3A, 0x46, 0x42, 0x46, 0x3A, 0x02, 0x02, 0x00, 0x00],
        'r' => [0x00, 0x00, 0x00, 0x5C, 0x62, 0x40, 0x40, 0x40, 0x40, 0x40, 0x00, 0x00],
        's' => [0x00, 0x00, 0x00, 0x3E, 0x40, 0x3C, 0x02, 0x02, 0x42, 0x3C, 0x00, 0x00],
        't' => [0x00, 0x10, 0x10, 0x7C, 0x10, 0x10, 0x10, 0x10, 0x10, 0x0C, 0x00, 0x00],
        'u' => [0x00, 0x00, 0x00, 0x42, 0x42, 0x42, 0x42, 0x42, 0x46, 0x3A, 0x00, 0x00],
        'v' => [0x00, 0x00, 0x00, 0x42, 0x42, 0x42, 0x24, 0x24, 0x18, 0x18, 0x00, 0x00],
        'w' => [0x00, 0x00, 0x00, 0x42, 0x42, 0x42, 0x5A, 0x66, 0x42, 0x42, 0x00, 0x00],
        'x' => [0x00, 0x00, 0x00, 0x42, 0x24, 0x18, 0x18, 0x24, 0x42, 0x42, 0x00, 0x00],
        'y' => [0x00, 0x00, 0x00, 0x42, 0x42, 0x42, 0x26, 0x1A, 0x02, 0x3C, 0x00, 0x00],
        'z' => [0x00, 0x00, 0x00, 0x7E, 0x04, 0x08, 0x10, 0x20, 0x40, 0x7E, 0x00, 0x00],
        '0' => [0x00, 0x3C, 0x42, 0x46, 0x4A, 0x52, 0x62, 0x42, 0x42, 0x3C, 0x00, 0x00],
        '1' => [0x00, 0x08, 0x18, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x3E, 0x00, 0x00],
        '2' => [0x00, 0x3C, 0x42, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x7E, 0x00, 0x00],
        '3' => [0x00, 0x3C, 0x42, 0x02, 0x1C, 0x02, 0x02, 0x02, 0x42, 0x3C, 0x00, 0x00],
        '4' => [0x00, 0x04, 0x0C, 0x14, 0x24, 0x44, 0x7E, 0x04, 0x04, 0x04, 0x00, 0x00],
        '5' => [0x00, 0x7E, 0x40, 0x40, 0x7C, 0x02, 0x02, 0x02, 0x42, 0x3C, 0x00, 0x00],
        '6' => [0x00, 0x1C, 0x20, 0x40, 0x7C, 0x42, 0x42, 0x42, 0x42, 0x3C, 0x00, 0x00],
        '7' => [0x00, 0x7E, 0x02, 0x04, 0x08, 0x08, 0x10, 0x10, 0x20, 0x20, 0x00, 0x00],
        '8' => [0x00, 0x3C, 0x42, 0x42, 0x3C, 0x42, 0x42, 0x42, 0x42, 0x3C, 0x00, 0x00],
        '9' => [0x00, 0x3C, 0x42, 0x42, 0x42, 0x3E, 0x02, 0x04, 0x08, 0x70, 0x00, 0x00],
        ':' => [0x00, 0x00, 0x00, 0x18, 0x18, 0x00, 0x00, 0x18, 0x18, 0x00, 0x00, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x18, 0x18, 0x00, 0x00],
        '|' => [0x00, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x00],
        '-' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x7E, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x7E, 0x00, 0x00],
        '/' => [0x00, 0x02, 0x02, 0x04, 0x08, 0x08, 0x10, 0x20, 0x40, 0x40, 0x00, 0x00],
        '%' => [0x00, 0x62, 0x64, 0x08, 0x10, 0x10, 0x20, 0x26, 0x46, 0x00, 0x00, 0x00],
        ' ' => [0x00; GLYPH_HEIGHT],
        // hollow box for anything the font lacks
        _ => [0x00, 0x7E, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x7E, 0x00, 0x00],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(image: &RgbImage, color: [u8; 3]) -> usize {
        image.pixels().filter(|p| p.0 == color).count()
    }

    #[test]
    fn draws_in_the_requested_color() {
        let mut image = RgbImage::new(200, 40);
        draw_text(&mut image, "Objects: 3", &TextStyle::default(), PixelFormat::Rgb);
        assert!(lit(&image, [0, 0, 255]) > 0);
        assert_eq!(lit(&image, [0, 0, 255]) + lit(&image, [0, 0, 0]), 200 * 40);
    }

    #[test]
    fn color_follows_frame_channel_order() {
        let mut image = RgbImage::new(100, 40);
        draw_text(&mut image, "O", &TextStyle::default(), PixelFormat::Bgr);
        assert!(lit(&image, [255, 0, 0]) > 0);
        assert_eq!(lit(&image, [0, 0, 255]), 0);
    }

    #[test]
    fn rendering_is_deterministic() {
        let mut a = RgbImage::new(300, 50);
        let mut b = RgbImage::new(300, 50);
        let text = "Objects: 3 | person: 2 | car: 1";
        draw_text(&mut a, text, &TextStyle::default(), PixelFormat::Rgb);
        draw_text(&mut b, text, &TextStyle::default(), PixelFormat::Rgb);
        assert_eq!(a, b);
    }

    #[test]
    fn text_past_the_edges_is_clipped() {
        let mut image = RgbImage::new(12, 8);
        let style = TextStyle {
            anchor: (4, 6),
            scale: 3,
            thickness: 2,
            ..TextStyle::default()
        };
        draw_text(&mut image, "WWW", &style, PixelFormat::Rgb);
        assert!(lit(&image, [0, 0, 255]) > 0);
    }

    #[test]
    fn scale_grows_the_glyph() {
        let mut small = RgbImage::new(100, 60);
        let mut large = RgbImage::new(100, 60);
        let base = TextStyle {
            scale: 1,
            ..TextStyle::default()
        };
        draw_text(&mut small, "H", &base, PixelFormat::Rgb);
        draw_text(
            &mut large,
            "H",
            &TextStyle { scale: 2, ..base.clone() },
            PixelFormat::Rgb,
        );
        assert_eq!(lit(&large, [0, 0, 255]), 4 * lit(&small, [0, 0, 255]));
    }

    #[test]
    fn thickness_widens_strokes() {
        let mut thin = RgbImage::new(100, 60);
        let mut thick = RgbImage::new(100, 60);
        let base = TextStyle::default();
        draw_text(&mut thin, "1", &base, PixelFormat::Rgb);
        draw_text(
            &mut thick,
            "1",
            &TextStyle { thickness: 3, ..base.clone() },
            PixelFormat::Rgb,
        );
        assert!(lit(&thick, [0, 0, 255]) > lit(&thin, [0, 0, 255]));
    }
}
