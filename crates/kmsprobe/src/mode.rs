use std::fmt;

use serde::Serialize;

/// Size of the kernel's `drm_mode_modeinfo`, the payload of a MODE_ID blob.
pub const MODE_INFO_SIZE: usize = 68;

const MODE_NAME_LEN: usize = 32;

/// One display timing as reported by a connector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct DisplayMode {
    pub name: String,
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
}

impl DisplayMode {
    pub fn size(&self) -> (u32, u32) {
        (self.hdisplay as u32, self.vdisplay as u32)
    }

    /// Serializes into the native-endian `drm_mode_modeinfo` layout.
    pub fn to_mode_info(&self) -> [u8; MODE_INFO_SIZE] {
        let mut out = [0u8; MODE_INFO_SIZE];
        let mut at = 0;
        let mut put = |bytes: &[u8]| {
            out[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        };

        put(&self.clock.to_ne_bytes());
        for v in [self.hdisplay, self.hsync_start, self.hsync_end, self.htotal, self.hskew] {
            put(&v.to_ne_bytes());
        }
        for v in [self.vdisplay, self.vsync_start, self.vsync_end, self.vtotal, self.vscan] {
            put(&v.to_ne_bytes());
        }
        put(&self.vrefresh.to_ne_bytes());
        put(&self.flags.to_ne_bytes());
        put(&self.mode_type.to_ne_bytes());

        // Names are NUL-terminated; keep at least one trailing zero.
        let name = self.name.as_bytes();
        let len = name.len().min(MODE_NAME_LEN - 1);
        put(&name[..len]);

        out
    }

    /// A CEA-style 60Hz timing for the given size, used by the virtual card.
    pub fn with_size(width: u16, height: u16) -> Self {
        Self {
            name: format!("{}x{}", width, height),
            clock: 148500,
            hdisplay: width,
            hsync_start: width.saturating_add(88),
            hsync_end: width.saturating_add(132),
            htotal: width.saturating_add(280),
            vdisplay: height,
            vsync_start: height.saturating_add(4),
            vsync_end: height.saturating_add(9),
            vtotal: height.saturating_add(45),
            vrefresh: 60,
            ..Default::default()
        }
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}Hz", self.hdisplay, self.vdisplay, self.vrefresh)
    }
}
