use mailmerge_pdf::markup::{self, ImageRef, Node, html_escape};
use mailmerge_pdf::model::{Alignment, BackgroundSource, CellValue, ColumnMapping, Rgb, Row, Template};
use mailmerge_pdf::units::{self, PageSize};

fn template(json: &str) -> Template {
    serde_json::from_str(json).unwrap()
}

fn two_field_template() -> Template {
    template(
        r##"{
            "name": "letter",
            "pages": [{
                "fields": [
                    {"type": "text", "x": 10, "y": 20, "width": 80, "height": 10, "column": "name",
                     "fontSize": 14, "fontFamily": "Times New Roman", "fontColor": "#ff0000",
                     "fontWeight": "700", "fontStyle": "italic", "textDecoration": "underline",
                     "textAlign": "center"},
                    {"type": "text", "x": 10, "y": 40, "column": "city"}
                ]
            }]
        }"##,
    )
}

fn mapping() -> ColumnMapping {
    serde_json::from_str(r#"{"name": "Name", "city": "City", "ignored": 5}"#).unwrap()
}

fn row(name: &str, city: &str) -> Row {
    [("Name", CellValue::text(name)), ("City", CellValue::text(city))]
        .into_iter()
        .collect()
}

#[test]
fn unit_conversions() {
    assert!((units::mm_to_px(25.4) - 96.0).abs() < 1e-3);
    assert!((units::mm_to_pt(10.0) - 28.3465).abs() < 1e-4);
    assert_eq!(units::font_size_pt(11.0), 11.0);

    let (w, h) = PageSize::A4.points();
    assert!((w - 595.2765).abs() < 0.01);
    assert!((h - 841.891).abs() < 0.01);
    assert_eq!(PageSize::default(), PageSize::A4);
}

#[test]
fn template_json_defaults_and_styles() {
    let t = two_field_template();
    let fields = &t.pages[0].fields;

    let styled = &fields[0].style;
    assert_eq!(styled.font_size_pt, 14.0);
    assert_eq!(styled.color, Rgb([255, 0, 0]));
    assert_eq!(styled.align, Alignment::Center);
    assert!(styled.bold && styled.italic && styled.underline);

    let plain = &fields[1];
    assert_eq!((plain.width, plain.height), (100.0, 20.0));
    assert_eq!(plain.style.font_size_pt, 12.0);
    assert_eq!(plain.style.font_family, "Arial");
    assert_eq!(plain.style.color, Rgb::BLACK);
    assert!(!plain.style.bold && !plain.style.italic && !plain.style.underline);
}

#[test]
fn mapping_ignores_non_string_values() {
    let m = mapping();
    assert_eq!(m.len(), 2);
    assert_eq!(m.header_for("name"), Some("Name"));
    assert_eq!(m.header_for("ignored"), None);
    assert_eq!(m.header_for(""), None);
}

#[test]
fn empty_values_produce_no_node() {
    let t = two_field_template();
    let page = markup::project_page(&t.pages[0].fields, &row("", "Oslo"), &mapping(), None);
    assert_eq!(page.nodes.len(), 1);
    let Node::Text(text) = &page.nodes[0] else {
        panic!("expected a text node");
    };
    assert_eq!(text.text, "Oslo");

    // Unmapped column and missing header behave the same way.
    let partial: Row = [("Name", CellValue::text("Ann"))].into_iter().collect();
    let page = markup::project_page(&t.pages[0].fields, &partial, &mapping(), None);
    assert_eq!(page.field_count(), 1);
}

#[test]
fn background_is_first_and_only_on_page_one() {
    let t = template(
        r#"{"pages": [
            {"fields": [{"x": 0, "y": 0, "column": "name"}]},
            {"fields": [{"x": 0, "y": 0, "column": "city"}]}
        ]}"#,
    );
    let bg = BackgroundSource::EmbeddedImage("iVBORw0KGgo=".into());
    let markup = markup::project(&t, &row("Ann", "Oslo"), &mapping(), &bg, PageSize::A4);

    assert_eq!(markup.pages.len(), 2);
    assert!(matches!(markup.pages[0].nodes[0], Node::Background(ImageRef::Embedded(_))));
    assert!(matches!(markup.pages[0].nodes[1], Node::Text(_)));
    assert!(markup.pages[1].nodes.iter().all(|n| !matches!(n, Node::Background(_))));
}

#[test]
fn text_node_carries_geometry_and_style() {
    let t = two_field_template();
    let page = markup::project_page(&t.pages[0].fields, &row("Ann", ""), &mapping(), None);
    let Node::Text(text) = &page.nodes[0] else {
        panic!("expected a text node");
    };
    assert_eq!(text.area.left, 10.0);
    assert_eq!(text.area.top, 20.0);
    assert_eq!(text.area.width, 80.0);
    assert_eq!(text.area.min_height, 10.0);
    assert_eq!(text.font_size_pt, 14.0);
    assert_eq!(text.font_family, "Times New Roman");
}

#[test]
fn projection_is_deterministic() {
    let t = two_field_template();
    let bg = BackgroundSource::RasterizedFile("/tmp/page1.jpg".into());
    let a = markup::project(&t, &row("Ann", "Oslo"), &mapping(), &bg, PageSize::A4);
    let b = markup::project(&t, &row("Ann", "Oslo"), &mapping(), &bg, PageSize::A4);
    assert_eq!(a, b);
    assert_eq!(a.to_html(), b.to_html());
}

#[test]
fn html_is_escaped() {
    assert_eq!(
        html_escape(r#"<b>"Tom" & 'Jerry'</b>"#),
        "&lt;b&gt;&quot;Tom&quot; &amp; &#039;Jerry&#039;&lt;/b&gt;"
    );

    let t = two_field_template();
    let html = markup::project(
        &t,
        &row("A&B<C>", "<script>alert('x')</script>"),
        &mapping(),
        &BackgroundSource::None,
        PageSize::A4,
    )
    .to_html();

    assert!(html.contains("A&amp;B&lt;C&gt;"));
    assert!(html.contains("&lt;script&gt;alert(&#039;x&#039;)&lt;/script&gt;"));
    assert!(!html.contains("<script>"));
    assert!(html.contains("left: 10mm; top: 20mm; width: 80mm; min-height: 10mm;"));
    assert!(html.contains("font-size: 14pt"));
    assert!(html.contains("color: #ff0000"));
}

#[test]
fn image_values_are_classified() {
    assert!(matches!(ImageRef::classify("data:image/png;base64,AAAA"), ImageRef::Embedded(_)));
    assert!(matches!(ImageRef::classify("https://example.com/a.png"), ImageRef::Url(_)));
    assert!(matches!(ImageRef::classify("logos/a.png"), ImageRef::File(_)));

    let t = template(r#"{"pages": [{"fields": [{"type": "image", "column": "logo"}]}]}"#);
    let m: ColumnMapping = [("logo", "Logo")].into_iter().collect();
    let r: Row = [("Logo", CellValue::text("https://example.com/logo.png"))]
        .into_iter()
        .collect();
    let page = markup::project_page(&t.pages[0].fields, &r, &m, None);
    assert!(matches!(&page.nodes[0], Node::Image(img) if img.source == ImageRef::Url("https://example.com/logo.png".into())));
}

#[test]
fn malformed_colours_fall_back_to_black() {
    for colour in ["aébcd", "#ééé", "#12345g", "red", ""] {
        let json = format!(r#"{{"pages": [{{"fields": [{{"column": "a", "fontColor": "{colour}"}}]}}]}}"#);
        let t = template(&json);
        assert_eq!(t.pages[0].fields[0].style.color, Rgb::BLACK, "{colour:?}");
    }
    assert_eq!(Rgb::parse_hex("#0a0"), Some(Rgb([0, 170, 0])));
    assert_eq!(Rgb::parse_hex("aébcd"), None);
}
