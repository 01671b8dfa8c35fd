use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::OnceLock;

use pdf_writer::types::{CidFontType, FontFlags, SystemInfo};
use pdf_writer::{Name, Pdf, Rect, Ref, Str};
use ttf_parser::Face;

pub(crate) struct FontEntry {
    pub(crate) pdf_name: String,
    pub(crate) font_ref: Ref,
    pub(crate) ascender_ratio: f32,
    /// Negative, below the baseline.
    pub(crate) descender_ratio: f32,
    kind: FontKind,
}

enum FontKind {
    /// Base-14 font drawn with single-byte WinAnsi codes.
    Standard {
        base_font: &'static str,
        /// Advance widths for WinAnsi bytes 32..=255 at 1000 units/em.
        widths_1000: Vec<f32>,
    },
    /// Installed face drawn with two-byte glyph ids (Identity-H).
    Embedded(EmbeddedFace),
}

struct EmbeddedFace {
    ps_name: String,
    data: Vec<u8>,
    face_index: u32,
    cff: bool,
    notdef_width: f32,
    /// Glyph id and advance at 1000 units/em, `None` when the face lacks the char.
    glyphs: HashMap<char, Option<(u16, f32)>>,
    /// Glyphs drawn so far and the char each one stands for.
    used: BTreeMap<u16, char>,
}

/// Content stream codes for one run of text.
pub(crate) struct Encoded {
    pub(crate) bytes: Vec<u8>,
    /// Chars the font has no glyph for.
    pub(crate) missing: usize,
}

impl FontEntry {
    /// Looks up every char of `text` so it can be measured.
    pub(crate) fn load_glyphs(&mut self, text: &str) {
        if let FontKind::Embedded(face) = &mut self.kind {
            face.load_glyphs(text);
        }
    }

    fn char_width(&self, c: char) -> f32 {
        match &self.kind {
            FontKind::Standard { widths_1000, .. } => winansi_byte(c)
                .unwrap_or(b'?')
                .checked_sub(32)
                .and_then(|i| widths_1000.get(i as usize))
                .copied()
                .unwrap_or(0.0),
            FontKind::Embedded(face) => face
                .glyphs
                .get(&c)
                .copied()
                .flatten()
                .map_or(face.notdef_width, |(_, w)| w),
        }
    }

    pub(crate) fn text_width(&self, text: &str, font_size: f32) -> f32 {
        text.chars().map(|c| self.char_width(c)).sum::<f32>() * font_size / 1000.0
    }

    /// Base-14 fonts show `?` for chars outside WinAnsi; embedded faces
    /// show `.notdef` for chars they lack.
    pub(crate) fn encode(&mut self, text: &str) -> Encoded {
        let mut bytes = Vec::with_capacity(text.len() * 2);
        let mut missing = 0;
        match &mut self.kind {
            FontKind::Standard { .. } => {
                for c in text.chars() {
                    bytes.push(winansi_byte(c).unwrap_or_else(|| {
                        missing += 1;
                        b'?'
                    }));
                }
            }
            FontKind::Embedded(face) => {
                face.load_glyphs(text);
                for c in text.chars() {
                    let gid = match face.glyphs.get(&c).copied().flatten() {
                        Some((gid, _)) => {
                            face.used.entry(gid).or_insert(c);
                            gid
                        }
                        None => {
                            missing += 1;
                            0
                        }
                    };
                    bytes.extend_from_slice(&gid.to_be_bytes());
                }
            }
        }
        Encoded { bytes, missing }
    }

    /// Writes the font objects once all text of the document is encoded.
    pub(crate) fn write(&self, pdf: &mut Pdf, alloc: &mut impl FnMut() -> Ref) {
        match &self.kind {
            FontKind::Standard { base_font, .. } => {
                pdf.type1_font(self.font_ref)
                    .base_font(Name(base_font.as_bytes()))
                    .encoding_predefined(Name(b"WinAnsiEncoding"));
            }
            FontKind::Embedded(face) => face.write(pdf, self.font_ref, alloc),
        }
    }
}

impl EmbeddedFace {
    /// Returns the face with its (ascender, descender) ratios.
    fn load(family: &str, data: Vec<u8>, face_index: u32) -> Option<(Self, f32, f32)> {
        let (ps_name, cff, notdef_width, ascender, descender) = {
            let face = Face::parse(&data, face_index).ok()?;
            let units = face.units_per_em() as f32;
            let ps_name = face
                .names()
                .into_iter()
                .find(|n| n.name_id == ttf_parser::name_id::POST_SCRIPT_NAME && n.is_unicode())
                .and_then(|n| n.to_string())
                .unwrap_or_else(|| family.chars().filter(|c| !c.is_whitespace()).collect());
            let notdef = face
                .glyph_hor_advance(ttf_parser::GlyphId(0))
                .map_or(0.0, |adv| adv as f32 / units * 1000.0);
            (
                ps_name,
                face.tables().cff.is_some(),
                notdef,
                face.ascender() as f32 / units,
                face.descender() as f32 / units,
            )
        };
        let face = EmbeddedFace {
            ps_name,
            data,
            face_index,
            cff,
            notdef_width,
            glyphs: HashMap::new(),
            used: BTreeMap::new(),
        };
        Some((face, ascender, descender))
    }

    fn load_glyphs(&mut self, text: &str) {
        if text.chars().all(|c| self.glyphs.contains_key(&c)) {
            return;
        }
        let Ok(face) = Face::parse(&self.data, self.face_index) else {
            return;
        };
        let units = face.units_per_em() as f32;
        for c in text.chars() {
            self.glyphs.entry(c).or_insert_with(|| {
                let gid = face.glyph_index(c)?;
                let advance = face.glyph_hor_advance(gid).unwrap_or(0);
                Some((gid.0, advance as f32 / units * 1000.0))
            });
        }
    }

    fn write(&self, pdf: &mut Pdf, font_ref: Ref, alloc: &mut impl FnMut() -> Ref) {
        let Ok(face) = Face::parse(&self.data, self.face_index) else {
            log::warn!("Font {} can no longer be parsed, not embedded", self.ps_name);
            return;
        };
        let cid_ref = alloc();
        let descriptor_ref = alloc();
        let data_ref = alloc();
        let cmap_ref = alloc();

        let mut glyphs: Vec<u16> = std::iter::once(0).chain(self.used.keys().copied()).collect();
        glyphs.dedup();
        let program = match subsetter::subset(&self.data, self.face_index, subsetter::Profile::pdf(&glyphs)) {
            Ok(subset) => subset,
            Err(e) => {
                log::warn!("Subsetting {} failed ({e:?}), embedding the whole face", self.ps_name);
                self.data.clone()
            }
        };
        log::debug!(
            "Embedding {} with {} glyph(s), {} of {} bytes",
            self.ps_name,
            glyphs.len(),
            program.len(),
            self.data.len()
        );
        let base_font = format!("{}+{}", subset_tag(&glyphs), self.ps_name);

        {
            let mut stream = pdf.stream(data_ref, &program);
            if self.cff {
                stream.pair(Name(b"Subtype"), Name(b"OpenType"));
            } else {
                stream.pair(Name(b"Length1"), i32::try_from(program.len()).unwrap_or(i32::MAX));
            }
        }

        let units = face.units_per_em() as f32;
        let scale = |v: i16| v as f32 / units * 1000.0;
        let bb = face.global_bounding_box();
        {
            let mut descriptor = pdf.font_descriptor(descriptor_ref);
            descriptor
                .name(Name(base_font.as_bytes()))
                .flags(FontFlags::SYMBOLIC)
                .bbox(Rect::new(scale(bb.x_min), scale(bb.y_min), scale(bb.x_max), scale(bb.y_max)))
                .italic_angle(face.italic_angle())
                .ascent(scale(face.ascender()))
                .descent(scale(face.descender()))
                .cap_height(face.capital_height().map_or(700.0, scale))
                .stem_v(if face.is_bold() { 140.0 } else { 80.0 });
            if self.cff {
                descriptor.font_file3(data_ref);
            } else {
                descriptor.font_file2(data_ref);
            }
        }

        {
            let mut cid = pdf.cid_font(cid_ref);
            cid.subtype(if self.cff { CidFontType::Type0 } else { CidFontType::Type2 })
                .base_font(Name(base_font.as_bytes()))
                .system_info(SystemInfo {
                    registry: Str(b"Adobe"),
                    ordering: Str(b"Identity"),
                    supplement: 0,
                })
                .font_descriptor(descriptor_ref)
                .default_width(self.notdef_width);
            if !self.cff {
                cid.cid_to_gid_map_predefined(Name(b"Identity"));
            }
            let mut widths = cid.widths();
            for (&gid, c) in &self.used {
                let width = self.glyphs.get(c).copied().flatten().map_or(0.0, |(_, w)| w);
                widths.consecutive(gid, [width]);
            }
        }

        pdf.stream(cmap_ref, to_unicode_cmap(&self.used).as_bytes());
        pdf.type0_font(font_ref)
            .base_font(Name(base_font.as_bytes()))
            .encoding_predefined(Name(b"Identity-H"))
            .descendant_font(cid_ref)
            .to_unicode(cmap_ref);
    }
}

/// Six capital letters naming a subset, stable for the same glyph set.
fn subset_tag(glyphs: &[u16]) -> String {
    let mut hasher = DefaultHasher::new();
    glyphs.hash(&mut hasher);
    let mut h = hasher.finish();
    (0..6)
        .map(|_| {
            let c = (b'A' + (h % 26) as u8) as char;
            h /= 26;
            c
        })
        .collect()
}

/// Maps glyph ids back to text so copy and search work on Identity-H fonts.
fn to_unicode_cmap(used: &BTreeMap<u16, char>) -> String {
    let mut out = String::from(
        "/CIDInit /ProcSet findresource begin\n\
         12 dict begin\n\
         begincmap\n\
         /CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> def\n\
         /CMapName /Adobe-Identity-UCS def\n\
         /CMapType 2 def\n\
         1 begincodespacerange\n<0000> <FFFF>\nendcodespacerange\n",
    );
    let pairs: Vec<(&u16, &char)> = used.iter().collect();
    for chunk in pairs.chunks(100) {
        let _ = writeln!(out, "{} beginbfchar", chunk.len());
        for (gid, c) in chunk {
            let mut units = [0u16; 2];
            let hex: String = c.encode_utf16(&mut units).iter().map(|u| format!("{u:04X}")).collect();
            let _ = writeln!(out, "<{gid:04X}> <{hex}>");
        }
        out.push_str("endbfchar\n");
    }
    out.push_str("endcmap\nCMapName currentdict /CMap defineresource pop\nend\nend\n");
    out
}

/// (lowercase family name, bold, italic) -> (file path, face index within TTC)
type FontLookup = HashMap<(String, bool, bool), (PathBuf, u32)>;

static FONT_INDEX: OnceLock<FontLookup> = OnceLock::new();

fn font_family_name(face: &Face) -> Option<String> {
    // Name ID 1 keeps "Arial Narrow" apart from "Arial".
    for name in face.names() {
        if name.name_id == ttf_parser::name_id::FAMILY
            && name.is_unicode()
            && let Some(s) = name.to_string()
        {
            return Some(s);
        }
    }
    None
}

fn read_font_style(data: &[u8], face_index: u32) -> Option<(String, bool, bool)> {
    let face = Face::parse(data, face_index).ok()?;
    let family = font_family_name(&face)?;
    Some((family, face.is_bold(), face.is_italic()))
}

fn font_directories() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();

    if let Ok(val) = std::env::var(crate::config::FONTS_ENV) {
        let sep = if cfg!(windows) { ';' } else { ':' };
        dirs.extend(
            val.split(sep)
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
        );
    }

    #[cfg(target_os = "macos")]
    {
        dirs.extend([
            "/Library/Fonts".into(),
            "/System/Library/Fonts".into(),
            "/System/Library/Fonts/Supplemental".into(),
        ]);
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(home).join("Library/Fonts"));
        }
    }

    #[cfg(target_os = "linux")]
    {
        dirs.extend([
            "/usr/share/fonts".into(),
            "/usr/local/share/fonts".into(),
        ]);
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(home).join(".local/share/fonts"));
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(windir) = std::env::var("WINDIR") {
            dirs.push(PathBuf::from(windir).join("Fonts"));
        } else {
            dirs.push("C:\\Windows\\Fonts".into());
        }
    }

    dirs
}

fn scan_font_dirs() -> FontLookup {
    let mut index = FontLookup::new();
    let mut stack = font_directories();
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let is_collection = match path.extension().and_then(|e| e.to_str()) {
                Some("ttf" | "otf" | "TTF" | "OTF") => false,
                Some("ttc" | "TTC") => true,
                _ => continue,
            };
            let Ok(data) = std::fs::read(&path) else {
                continue;
            };
            let face_count = if is_collection {
                ttf_parser::fonts_in_collection(&data).unwrap_or(1)
            } else {
                1
            };
            for face_idx in 0..face_count {
                if let Some((family, bold, italic)) = read_font_style(&data, face_idx) {
                    index
                        .entry((family.to_lowercase(), bold, italic))
                        .or_insert((path.clone(), face_idx));
                }
            }
        }
    }
    log::debug!("Indexed {} system font faces", index.len());
    index
}

/// Falls back to the regular face when the styled one is not installed.
fn find_font_file(family: &str, bold: bool, italic: bool) -> Option<(PathBuf, u32)> {
    let index = FONT_INDEX.get_or_init(scan_font_dirs);
    let key = family.to_lowercase();
    index
        .get(&(key.clone(), bold, italic))
        .or_else(|| {
            if bold || italic {
                index.get(&(key, false, false))
            } else {
                None
            }
        })
        .cloned()
}

/// WinAnsi (Windows-1252) code of `c`, if it has one.
pub(crate) fn winansi_byte(c: char) -> Option<u8> {
    match c as u32 {
        0x0000..=0x007F => Some(c as u8),
        0x00A0..=0x00FF => Some(c as u8), // Latin-1 supplement maps directly
        0x20AC => Some(0x80),
        0x201A => Some(0x82),
        0x0192 => Some(0x83),
        0x201E => Some(0x84),
        0x2026 => Some(0x85),
        0x2020 => Some(0x86),
        0x2021 => Some(0x87),
        0x02C6 => Some(0x88),
        0x2030 => Some(0x89),
        0x0160 => Some(0x8A),
        0x2039 => Some(0x8B),
        0x0152 => Some(0x8C),
        0x017D => Some(0x8E),
        0x2018 => Some(0x91),
        0x2019 => Some(0x92),
        0x201C => Some(0x93),
        0x201D => Some(0x94),
        0x2022 => Some(0x95), // bullet
        0x2013 => Some(0x96),
        0x2014 => Some(0x97),
        0x02DC => Some(0x98),
        0x2122 => Some(0x99),
        0x0161 => Some(0x9A),
        0x203A => Some(0x9B),
        0x0153 => Some(0x9C),
        0x017E => Some(0x9E),
        0x0178 => Some(0x9F),
        _ => None,
    }
}

/// The base-14 family a CSS-ish family name falls back to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StandardFamily {
    Helvetica,
    Times,
    Courier,
}

impl StandardFamily {
    pub(crate) fn classify(family: &str) -> Self {
        let f = family.to_lowercase();
        if f.contains("courier") || f.contains("mono") || f.contains("consolas") {
            StandardFamily::Courier
        } else if f.contains("times") || f.contains("georgia") || f.contains("garamond") || f == "serif" {
            StandardFamily::Times
        } else {
            StandardFamily::Helvetica
        }
    }

    fn base_font(self, bold: bool, italic: bool) -> &'static str {
        match (self, bold, italic) {
            (StandardFamily::Helvetica, false, false) => "Helvetica",
            (StandardFamily::Helvetica, true, false) => "Helvetica-Bold",
            (StandardFamily::Helvetica, false, true) => "Helvetica-Oblique",
            (StandardFamily::Helvetica, true, true) => "Helvetica-BoldOblique",
            (StandardFamily::Times, false, false) => "Times-Roman",
            (StandardFamily::Times, true, false) => "Times-Bold",
            (StandardFamily::Times, false, true) => "Times-Italic",
            (StandardFamily::Times, true, true) => "Times-BoldItalic",
            (StandardFamily::Courier, false, false) => "Courier",
            (StandardFamily::Courier, true, false) => "Courier-Bold",
            (StandardFamily::Courier, false, true) => "Courier-Oblique",
            (StandardFamily::Courier, true, true) => "Courier-BoldOblique",
        }
    }

    /// (ascender, descender) as fractions of the em.
    fn metrics(self) -> (f32, f32) {
        match self {
            StandardFamily::Helvetica => (0.718, -0.207),
            StandardFamily::Times => (0.683, -0.217),
            StandardFamily::Courier => (0.629, -0.157),
        }
    }

    fn widths(self) -> Vec<f32> {
        match self {
            StandardFamily::Helvetica => helvetica_widths(),
            StandardFamily::Times => times_widths(),
            StandardFamily::Courier => vec![600.0; 224],
        }
    }
}

/// Approximate Helvetica widths at 1000 units/em for WinAnsi chars 32..=255.
fn helvetica_widths() -> Vec<f32> {
    (32u8..=255u8)
        .map(|b| match b {
            32 => 278.0,
            33..=47 => 333.0,
            48..=57 => 556.0,
            58..=64 => 333.0,
            73 | 74 => 278.0,                     // I J
            77 => 833.0,                          // M
            65..=90 => 667.0,
            91..=96 => 333.0,
            102 | 105 | 106 | 108 | 116 => 278.0, // f i j l t
            109 | 119 => 833.0,                   // m w
            97..=122 => 556.0,
            _ => 556.0,
        })
        .collect()
}

/// Approximate Times-Roman widths, same layout as [`helvetica_widths`].
fn times_widths() -> Vec<f32> {
    (32u8..=255u8)
        .map(|b| match b {
            32 => 250.0,
            33..=47 => 333.0,
            48..=57 => 500.0,
            58..=64 => 278.0,
            73 => 333.0,
            74 => 389.0,
            77 => 889.0,
            87 => 944.0,
            65..=90 => 667.0,
            91..=96 => 333.0,
            102 | 105 | 106 | 108 | 116 => 278.0,
            109 => 778.0,
            119 => 722.0,
            97..=122 => 444.0,
            _ => 500.0,
        })
        .collect()
}

/// First entry of a CSS font stack, unquoted.
pub(crate) fn primary_font_name(name: &str) -> &str {
    name.split(',')
        .next()
        .unwrap_or(name)
        .trim()
        .trim_matches(['"', '\''])
}

pub(crate) fn font_key(family: &str, bold: bool, italic: bool) -> String {
    let base = primary_font_name(family).to_lowercase();
    match (bold, italic) {
        (true, true) => format!("{base}/BI"),
        (true, false) => format!("{base}/B"),
        (false, true) => format!("{base}/I"),
        (false, false) => base,
    }
}

/// Resolves one family/style. Installed faces are used when `system_fonts`
/// is set; anything else falls back to a base-14 font of the same class.
/// Objects are written later by [`FontEntry::write`].
pub(crate) fn register_font(
    family: &str,
    bold: bool,
    italic: bool,
    pdf_name: String,
    alloc: &mut impl FnMut() -> Ref,
    system_fonts: bool,
) -> FontEntry {
    let family = primary_font_name(family);
    let font_ref = alloc();

    let embedded = if system_fonts {
        find_font_file(family, bold, italic).and_then(|(path, face_index)| {
            let data = std::fs::read(&path).ok()?;
            EmbeddedFace::load(family, data, face_index)
        })
    } else {
        None
    };

    if let Some((face, ascender_ratio, descender_ratio)) = embedded {
        log::debug!("Font {family} bold={bold} italic={italic} resolved to {}", face.ps_name);
        return FontEntry {
            pdf_name,
            font_ref,
            ascender_ratio,
            descender_ratio,
            kind: FontKind::Embedded(face),
        };
    }

    let standard = StandardFamily::classify(family);
    let base_font = standard.base_font(bold, italic);
    log::debug!("Font {family} bold={bold} italic={italic} not installed, using {base_font}");
    let (ascender_ratio, descender_ratio) = standard.metrics();
    FontEntry {
        pdf_name,
        font_ref,
        ascender_ratio,
        descender_ratio,
        kind: FontKind::Standard {
            base_font,
            widths_1000: standard.widths(),
        },
    }
}
