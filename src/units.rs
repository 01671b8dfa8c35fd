//! Millimeter based template geometry converted to backend units.

pub const PX_PER_MM: f32 = 3.779527559;
pub const PT_PER_MM: f32 = 2.83465;

/// CSS pixels at 96 DPI, used by the HTML markup.
pub fn mm_to_px(mm: f32) -> f32 {
    mm * PX_PER_MM
}

/// PDF points, used for page boxes and every drawing coordinate.
pub fn mm_to_pt(mm: f32) -> f32 {
    mm * PT_PER_MM
}

/// Template font sizes are already points. Designers type the number they
/// see in desktop tools, so no px to pt rescaling happens here.
pub fn font_size_pt(size: f32) -> f32 {
    size
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageSize {
    pub width_mm: f32,
    pub height_mm: f32,
}

impl PageSize {
    pub const A4: PageSize = PageSize {
        width_mm: 210.0,
        height_mm: 297.0,
    };

    pub fn points(self) -> (f32, f32) {
        (mm_to_pt(self.width_mm), mm_to_pt(self.height_mm))
    }
}

impl Default for PageSize {
    fn default() -> Self {
        PageSize::A4
    }
}
