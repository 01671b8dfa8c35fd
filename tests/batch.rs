use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use mailmerge_pdf::background::NO_RASTERIZER_WARNING;
use mailmerge_pdf::batch::{MSG_NOTHING_GENERATED, MSG_SUCCESS, filename_for};
use mailmerge_pdf::model::{CellValue, ColumnMapping, Row, Template};
use mailmerge_pdf::units::PageSize;
use mailmerge_pdf::{
    BackgroundResolver, BatchGenerator, BatchRequest, BatchState, Error, FailurePolicy, RasterOptions,
    Rasterizer, RenderConfig,
};

/// Collects warnings from every test in this binary.
struct WarningLog;

static WARNINGS: Mutex<Vec<String>> = Mutex::new(Vec::new());
static INIT_LOG: Once = Once::new();

impl log::Log for WarningLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            WARNINGS.lock().unwrap().push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

fn capture_warnings() {
    INIT_LOG.call_once(|| {
        log::set_logger(&WarningLog).unwrap();
        log::set_max_level(log::LevelFilter::Warn);
    });
}

fn warned(needle: &str) -> bool {
    WARNINGS.lock().unwrap().iter().any(|w| w.contains(needle))
}

struct FakeRasterizer {
    calls: Arc<AtomicUsize>,
    available: bool,
    fails: bool,
}

impl Rasterizer for FakeRasterizer {
    fn name(&self) -> &str {
        "fake"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn rasterize(&self, _pdf: &Path, out_dir: &Path, _opts: &RasterOptions) -> Result<PathBuf, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fails {
            return Err(Error::Rasterize("fake failure".into()));
        }
        std::fs::create_dir_all(out_dir)?;
        let out = out_dir.join("fake_page1.jpg");
        image::RgbImage::from_pixel(21, 29, image::Rgb([240, 240, 240])).save(&out)?;
        Ok(out)
    }
}

fn fake(calls: &Arc<AtomicUsize>, available: bool, fails: bool) -> Box<dyn Rasterizer> {
    Box::new(FakeRasterizer {
        calls: Arc::clone(calls),
        available,
        fails,
    })
}

/// Uncompressed streams and base-14 fonts, so text is greppable in the output.
fn plain_config() -> RenderConfig {
    RenderConfig {
        compress: false,
        system_fonts: false,
        remote_images: false,
        ..Default::default()
    }
}

fn generator(cache: &Path, rasterizers: Vec<Box<dyn Rasterizer>>) -> BatchGenerator {
    let resolver = BackgroundResolver::with_rasterizers(cache, RasterOptions::default(), rasterizers);
    BatchGenerator::new(resolver, plain_config())
}

fn template() -> Template {
    serde_json::from_str(
        r#"{"pages": [{"fields": [
            {"type": "text", "x": 20, "y": 30, "width": 120, "height": 12, "column": "name", "fontSize": 16},
            {"type": "text", "x": 20, "y": 50, "width": 120, "height": 12, "column": "city", "textAlign": "right"}
        ]}]}"#,
    )
    .unwrap()
}

fn mapping() -> ColumnMapping {
    [("name", "Name"), ("city", "City")].into_iter().collect()
}

fn rows(names: &[&str]) -> Vec<Row> {
    names
        .iter()
        .map(|n| -> Row {
            [("Name", CellValue::text(*n)), ("City", CellValue::text("Bergen"))]
                .into_iter()
                .collect()
        })
        .collect()
}

fn request(names: &[&str]) -> BatchRequest {
    BatchRequest {
        template: template(),
        rows: rows(names),
        mapping: mapping(),
        ..Default::default()
    }
}

fn decode(b64: &str) -> Vec<u8> {
    STANDARD.decode(b64).unwrap()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn source_pdf(dir: &Path) -> PathBuf {
    let path = dir.join("source.pdf");
    std::fs::write(&path, b"%PDF-1.4\n%%EOF\n").unwrap();
    path
}

#[test]
fn empty_batch_is_a_soft_failure() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut generator = generator(dir.path(), vec![fake(&calls, true, false)]);

    let mut req = request(&[]);
    req.source_document = Some(source_pdf(dir.path()));
    let report = generator.generate(&req).unwrap();

    assert!(!report.success);
    assert_eq!(report.message, MSG_NOTHING_GENERATED);
    assert!(report.pdfs.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0, "no background work for an empty batch");
}

#[test]
fn three_rows_three_documents() {
    let dir = tempfile::tempdir().unwrap();
    let mut generator = generator(dir.path(), vec![]);
    let report = generator.generate(&request(&["Ann", "Bob", "Cy"])).unwrap();

    assert!(report.success);
    assert_eq!(report.message, MSG_SUCCESS);
    assert_eq!(generator.state(), BatchState::Completed);

    let indices: Vec<usize> = report.pdfs.iter().map(|d| d.index).collect();
    assert_eq!(indices, vec![1, 2, 3]);

    for (doc, name) in report.pdfs.iter().zip(["Ann", "Bob", "Cy"]) {
        assert!(doc.filename.ends_with(".pdf") && doc.filename.len() == 10, "{}", doc.filename);
        let pdf = decode(&doc.base64);
        assert!(pdf.starts_with(b"%PDF-"));
        assert!(contains(&pdf, format!("({name})").as_bytes()), "row text for {name}");
        assert!(contains(&pdf, b"(Bergen)"));
        assert!(contains(&pdf, b"/Helvetica"));
    }
}

#[test]
fn filenames_are_distinct_within_a_batch() {
    let dir = tempfile::tempdir().unwrap();
    let names: Vec<String> = (0..50).map(|i| format!("row{i}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let report = generator(dir.path(), vec![]).generate(&request(&names)).unwrap();

    let mut filenames: Vec<&str> = report.pdfs.iter().map(|d| d.filename.as_str()).collect();
    filenames.sort_unstable();
    filenames.dedup();
    assert_eq!(filenames.len(), 50);
}

#[test]
fn filename_token_wraps_at_a_million() {
    assert_eq!(filename_for(42, 0), "000042.pdf");
    assert_eq!(filename_for(999_999, 1), "000000.pdf");
    assert_eq!(filename_for(1_234_567_890, 3), "567893.pdf");
}

#[test]
fn background_is_resolved_once_per_batch() {
    for n in [1usize, 5, 100] {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut generator = generator(&dir.path().join("cache"), vec![fake(&calls, true, false)]);

        let names: Vec<String> = (0..n).map(|i| format!("r{i}")).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut req = request(&names);
        req.source_document = Some(source_pdf(dir.path()));

        let report = generator.generate(&req).unwrap();
        assert_eq!(report.pdfs.len(), n);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "batch of {n}");

        let first = decode(&report.pdfs[0].base64);
        assert!(contains(&first, b"/DCTDecode"));
        assert!(contains(&first, b"/Im1 Do"));
    }
}

#[test]
fn falls_through_to_the_next_rasterizer() {
    let dir = tempfile::tempdir().unwrap();
    let missing = Arc::new(AtomicUsize::new(0));
    let broken = Arc::new(AtomicUsize::new(0));
    let working = Arc::new(AtomicUsize::new(0));
    let mut generator = generator(
        dir.path(),
        vec![
            fake(&missing, false, false),
            fake(&broken, true, true),
            fake(&working, true, false),
        ],
    );

    let mut req = request(&["Ann"]);
    req.source_document = Some(source_pdf(dir.path()));
    let report = generator.generate(&req).unwrap();

    assert!(report.success);
    assert_eq!(missing.load(Ordering::SeqCst), 0);
    assert_eq!(broken.load(Ordering::SeqCst), 1);
    assert_eq!(working.load(Ordering::SeqCst), 1);
}

#[test]
fn no_tools_renders_without_background() {
    capture_warnings();
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut generator = generator(dir.path(), vec![fake(&calls, false, false)]);

    let mut req = request(&["Ann", "Bob"]);
    req.source_document = Some(source_pdf(dir.path()));
    let report = generator.generate(&req).unwrap();

    assert!(report.success);
    assert_eq!(report.pdfs.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!contains(&decode(&report.pdfs[0].base64), b"/XObject"));
    assert!(warned(NO_RASTERIZER_WARNING));
}

#[test]
fn missing_source_document_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut generator = generator(dir.path(), vec![fake(&calls, true, false)]);

    let mut req = request(&["Ann"]);
    req.source_document = Some(dir.path().join("gone.pdf"));
    let report = generator.generate(&req).unwrap();

    assert!(report.success);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn page_image_wins_over_source_document() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut generator = generator(dir.path(), vec![fake(&calls, true, false)]);

    let mut png = std::io::Cursor::new(Vec::new());
    image::RgbaImage::from_pixel(8, 8, image::Rgba([10, 20, 30, 128]))
        .write_to(&mut png, image::ImageFormat::Png)
        .unwrap();

    let mut req = request(&["Ann"]);
    req.source_document = Some(source_pdf(dir.path()));
    req.page_image = Some(format!("data:image/png;base64,{}", STANDARD.encode(png.get_ref())));
    let report = generator.generate(&req).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let pdf = decode(&report.pdfs[0].base64);
    assert!(contains(&pdf, b"/FlateDecode"));
    assert!(contains(&pdf, b"/SMask"), "translucent PNG keeps its alpha");
}

#[test]
fn unreadable_background_aborts_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let mut generator = generator(dir.path(), vec![]);

    let mut req = request(&["Ann", "Bob"]);
    req.page_image = Some("definitely not an image".into());
    let err = generator.generate(&req).unwrap_err();

    assert!(matches!(err, Error::Batch { row: 1, .. }), "{err}");
    assert_eq!(generator.state(), BatchState::Failed);
}

#[test]
fn row_with_only_empty_values_still_renders() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(&[]);
    req.rows = vec![
        [("Name", CellValue::empty()), ("City", CellValue::empty())]
            .into_iter()
            .collect::<Row>(),
    ];

    let report = generator(dir.path(), vec![]).generate(&req).unwrap();
    assert!(report.success);
    assert_eq!(report.pdfs.len(), 1);
    let pdf = decode(&report.pdfs[0].base64);
    assert!(pdf.starts_with(b"%PDF-"));
    assert!(!contains(&pdf, b" Tj"));
}

#[test]
fn markup_characters_reach_the_pdf_literally() {
    let dir = tempfile::tempdir().unwrap();
    let report = generator(dir.path(), vec![]).generate(&request(&["A&B<C>"])).unwrap();
    let pdf = decode(&report.pdfs[0].base64);
    assert!(contains(&pdf, b"(A&B<C>)"));
    assert!(!contains(&pdf, b"&amp;"));
}

#[test]
fn invalid_templates_fail_before_rendering() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut generator = generator(dir.path(), vec![fake(&calls, true, false)]);

    let mut no_pages = request(&["Ann"]);
    no_pages.template.pages.clear();
    no_pages.source_document = Some(source_pdf(dir.path()));
    assert!(matches!(generator.generate(&no_pages), Err(Error::InvalidTemplate(_))));
    assert_eq!(generator.state(), BatchState::Failed);

    let mut negative = request(&["Ann"]);
    negative.template.pages[0].fields[0].width = -1.0;
    assert!(matches!(generator.generate(&negative), Err(Error::InvalidTemplate(_))));

    let mut tiny_font = request(&["Ann"]);
    tiny_font.template.pages[0].fields[1].style.font_size_pt = 0.0;
    assert!(matches!(generator.generate(&tiny_font), Err(Error::InvalidTemplate(_))));

    let mut nan = request(&["Ann"]);
    nan.template.pages[0].fields[0].x = f32::NAN;
    assert!(matches!(generator.generate(&nan), Err(Error::InvalidTemplate(_))));

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn failure_policy_controls_row_errors() {
    let dir = tempfile::tempdir().unwrap();
    let broken_page = RenderConfig {
        page: PageSize {
            width_mm: 0.0,
            height_mm: 297.0,
        },
        ..plain_config()
    };
    let resolver = || BackgroundResolver::with_rasterizers(dir.path(), RasterOptions::default(), vec![]);

    let mut abort = BatchGenerator::new(resolver(), broken_page.clone());
    let err = abort.generate(&request(&["Ann", "Bob"])).unwrap_err();
    assert!(matches!(err, Error::Batch { row: 1, .. }));

    let mut skip = BatchGenerator::new(resolver(), broken_page).with_policy(FailurePolicy::SkipFailedRows);
    let report = skip.generate(&request(&["Ann", "Bob"])).unwrap();
    assert!(!report.success);
    assert_eq!(report.message, MSG_NOTHING_GENERATED);
    let failed: Vec<usize> = report.failures.iter().map(|f| f.index).collect();
    assert_eq!(failed, vec![1, 2]);
}

#[test]
fn report_serializes_with_wire_keys() {
    let dir = tempfile::tempdir().unwrap();
    let report = generator(dir.path(), vec![]).generate(&request(&["Ann"])).unwrap();
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["success"], true);
    assert!(json.get("failures").is_none());
    let doc = &json["pdfs"][0];
    let mut keys: Vec<&str> = doc.as_object().unwrap().keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["base64", "filename", "index"]);
    assert_eq!(doc["index"], 1);
}

fn png_bytes(alpha: u8) -> Vec<u8> {
    let mut png = std::io::Cursor::new(Vec::new());
    image::RgbaImage::from_pixel(8, 8, image::Rgba([10, 20, 30, alpha]))
        .write_to(&mut png, image::ImageFormat::Png)
        .unwrap();
    png.into_inner()
}

fn jpeg_bytes() -> Vec<u8> {
    let mut jpg = std::io::Cursor::new(Vec::new());
    image::RgbImage::from_pixel(8, 8, image::Rgb([200, 100, 50]))
        .write_to(&mut jpg, image::ImageFormat::Jpeg)
        .unwrap();
    jpg.into_inner()
}

fn logo_request(rows: Vec<Row>) -> BatchRequest {
    BatchRequest {
        template: serde_json::from_str(
            r#"{"pages": [{"fields": [
                {"type": "text", "x": 10, "y": 10, "width": 50, "height": 10, "column": "name"},
                {"type": "image", "x": 10, "y": 30, "width": 40, "height": 20, "column": "logo"}
            ]}]}"#,
        )
        .unwrap(),
        rows,
        mapping: [("name", "Name"), ("logo", "Logo")].into_iter().collect(),
        ..Default::default()
    }
}

fn logo_row(name: &str, logo: &str) -> Row {
    [("Name", CellValue::text(name)), ("Logo", CellValue::text(logo))]
        .into_iter()
        .collect()
}

#[test]
fn text_and_image_fields_per_row() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("logo.jpg"), jpeg_bytes()).unwrap();
    let embedded = format!("data:image/png;base64,{}", STANDARD.encode(png_bytes(255)));

    let req = logo_request(vec![
        logo_row("Ann", &embedded),
        logo_row("Bob", "logo.jpg"),
        logo_row("Cy", ""),
    ]);
    let resolver = BackgroundResolver::with_rasterizers(dir.path(), RasterOptions::default(), vec![]);
    let config = RenderConfig {
        image_root: Some(dir.path().to_path_buf()),
        ..plain_config()
    };
    let report = BatchGenerator::new(resolver, config).generate(&req).unwrap();

    assert!(report.success);
    let indices: Vec<usize> = report.pdfs.iter().map(|d| d.index).collect();
    assert_eq!(indices, vec![1, 2, 3]);

    let pdfs: Vec<Vec<u8>> = report.pdfs.iter().map(|d| decode(&d.base64)).collect();
    for (pdf, name) in pdfs.iter().zip(["Ann", "Bob", "Cy"]) {
        assert!(contains(pdf, format!("({name})").as_bytes()));
    }
    assert!(contains(&pdfs[0], b"/Im1 Do") && contains(&pdfs[0], b"/FlateDecode"));
    assert!(contains(&pdfs[1], b"/Im1 Do") && contains(&pdfs[1], b"/DCTDecode"));
    assert!(!contains(&pdfs[2], b"/XObject"), "empty image value draws nothing");
}

#[test]
fn local_images_stay_inside_the_image_root() {
    capture_warnings();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("public");
    std::fs::create_dir_all(&root).unwrap();
    let secret = dir.path().join("secret.png");
    std::fs::write(&secret, png_bytes(255)).unwrap();

    let outside = [
        secret.display().to_string(),
        "../secret.png".to_string(),
    ];
    for (root_dir, value) in [(None, &outside[0]), (Some(root.clone()), &outside[0]), (Some(root.clone()), &outside[1])] {
        let resolver = BackgroundResolver::with_rasterizers(dir.path(), RasterOptions::default(), vec![]);
        let config = RenderConfig {
            image_root: root_dir,
            ..plain_config()
        };
        let report = BatchGenerator::new(resolver, config)
            .generate(&logo_request(vec![logo_row("Ann", value)]))
            .unwrap();
        let pdf = decode(&report.pdfs[0].base64);
        assert!(contains(&pdf, b"(Ann)"));
        assert!(!contains(&pdf, b"/Subtype /Image"), "{value} must not be embedded");
    }
    assert!(warned("Skipping image field"));
}

#[test]
fn image_cache_does_not_outlive_a_batch() {
    let dir = tempfile::tempdir().unwrap();
    let logo = dir.path().join("logo.img");
    let resolver = BackgroundResolver::with_rasterizers(dir.path(), RasterOptions::default(), vec![]);
    let config = RenderConfig {
        image_root: Some(dir.path().to_path_buf()),
        ..plain_config()
    };
    let mut generator = BatchGenerator::new(resolver, config);
    let req = logo_request(vec![logo_row("Ann", "logo.img")]);

    std::fs::write(&logo, jpeg_bytes()).unwrap();
    let first = decode(&generator.generate(&req).unwrap().pdfs[0].base64);
    assert!(contains(&first, b"/DCTDecode"));

    std::fs::write(&logo, png_bytes(100)).unwrap();
    let second = decode(&generator.generate(&req).unwrap().pdfs[0].base64);
    assert!(!contains(&second, b"/DCTDecode"));
    assert!(contains(&second, b"/SMask"));
}

#[test]
fn text_outside_winansi_is_not_dropped_silently() {
    capture_warnings();
    let dir = tempfile::tempdir().unwrap();
    let report = generator(dir.path(), vec![]).generate(&request(&["Иван 王"])).unwrap();
    let pdf = decode(&report.pdfs[0].base64);

    assert!(contains(&pdf, b" Tf"));
    assert!(contains(&pdf, b"(???? ?)"));
    assert!(warned("have no glyph in font"));
}
