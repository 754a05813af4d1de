use serde::{Deserialize, Serialize};

/// Test image written into a freshly mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    /// Diagonal colour bands, 64 pixels wide.
    Tiles,
    /// One solid colour.
    Plain,
}

impl std::str::FromStr for Pattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tiles" => Ok(Pattern::Tiles),
            "plain" => Ok(Pattern::Plain),
            other => Err(format!("unknown pattern {:?}", other)),
        }
    }
}

/// Geometry of a mapped buffer. Rows start every `pitch` bytes; anything
/// past `width` pixels in a row is padding and left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub pitch: u32,
}

impl Pattern {
    /// Paints the pattern. `color` is a packed ARGB word and only used by
    /// [`Pattern::Plain`].
    pub fn fill(self, pixels: &mut [u8], surface: Surface, color: u32) {
        let cpp = (surface.bpp / 8).clamp(1, 4) as usize;
        let width = surface.width as usize;
        let pitch = surface.pitch as usize;
        if pitch == 0 {
            return;
        }

        for (y, row) in pixels
            .chunks_mut(pitch)
            .take(surface.height as usize)
            .enumerate()
        {
            for (x, pixel) in row.chunks_exact_mut(cpp).take(width).enumerate() {
                let value = match self {
                    Pattern::Tiles => tile(x, y, width),
                    Pattern::Plain => color,
                };
                pixel.copy_from_slice(&value.to_le_bytes()[..cpp]);
            }
        }
    }
}

fn tile(x: usize, y: usize, width: usize) -> u32 {
    let d = x + y;
    let quot = (d / width) as u32;
    let rem = (d % width) as u32;
    0x0013_0502u32
        .wrapping_mul(quot >> 6)
        .wrapping_add(0x000a_1120u32.wrapping_mul(rem >> 6))
        & 0x00ff_ffff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(buf: &[u8], pitch: usize, x: usize, y: usize) -> u32 {
        let at = y * pitch + x * 4;
        u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    }

    #[test]
    fn tiles_follow_the_diagonal() {
        let surface = Surface {
            width: 256,
            height: 4,
            bpp: 32,
            pitch: 1024,
        };
        let mut buf = vec![0u8; 1024 * 4];
        Pattern::Tiles.fill(&mut buf, surface, 0);

        assert_eq!(pixel(&buf, 1024, 0, 0), 0);
        assert_eq!(pixel(&buf, 1024, 64, 0), 0x000a_1120);
        assert_eq!(pixel(&buf, 1024, 63, 1), 0x000a_1120);
        assert_eq!(pixel(&buf, 1024, 130, 0), 0x0014_2240);
    }

    #[test]
    fn plain_respects_pitch_padding() {
        let surface = Surface {
            width: 3,
            height: 2,
            bpp: 32,
            pitch: 16,
        };
        let mut buf = vec![0xAAu8; 32];
        Pattern::Plain.fill(&mut buf, surface, 0xFF77_7777);

        assert_eq!(pixel(&buf, 16, 2, 1), 0xFF77_7777);
        assert_eq!(&buf[12..16], &[0xAA; 4]);
        assert_eq!(&buf[28..32], &[0xAA; 4]);
    }

    #[test]
    fn short_buffers_are_not_overrun() {
        let surface = Surface {
            width: 64,
            height: 64,
            bpp: 32,
            pitch: 256,
        };
        let mut buf = vec![0u8; 300];
        Pattern::Tiles.fill(&mut buf, surface, 0);
        Pattern::Plain.fill(&mut buf, surface, 0x1234_5678);
        assert_eq!(pixel(&buf, 256, 0, 0), 0x1234_5678);
    }

    #[test]
    fn parses_names() {
        assert_eq!("tiles".parse::<Pattern>(), Ok(Pattern::Tiles));
        assert_eq!("plain".parse::<Pattern>(), Ok(Pattern::Plain));
        assert!("checker".parse::<Pattern>().is_err());
    }
}
