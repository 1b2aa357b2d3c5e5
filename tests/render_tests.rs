mod support;

use serde_json::json;
use std::sync::Arc;
use support::{
    all_xml, build_template, cell_num_fmt, engine, formula, merges, part_names, part_text,
    read_output, sheet1, value,
};
use umya_spreadsheet::Spreadsheet;
use xlsx_template::config::StreamingMode;
use xlsx_template::data::DocumentMetadata;
use xlsx_template::{ImageData, MapDataSource, RenderConfig, RenderMode, Template};

const SHEET1: &str = "xl/worksheets/sheet1.xml";

fn orders_template(book: &mut Spreadsheet) {
    let sheet = sheet1(book);
    sheet.get_cell_mut("A1").set_value("Report: ${title}");
    sheet.get_cell_mut("B1").set_value("Header");
    sheet.get_cell_mut("A2").set_value("${repeat(items, A3:C3, item)}");
    sheet.get_cell_mut("A3").set_value("${item.name}");
    sheet.get_cell_mut("B3").set_value("${item.qty}");
    sheet.get_cell_mut("C3").set_formula("B3*2");
    sheet.get_cell_mut("A4").set_value("Total");
    sheet.get_cell_mut("B4").set_formula("SUM(B3:B3)");
}

fn orders_data() -> MapDataSource {
    MapDataSource::from_json(json!({
        "title": "Q3",
        "items": [
            {"name": "Apples", "qty": 1},
            {"name": "Pears", "qty": 2},
            {"name": "Plums", "qty": 3}
        ]
    }))
}

fn render(template: &Template, data: &MapDataSource, config: RenderConfig) -> Vec<u8> {
    engine(config).render(template, data).expect("render")
}

#[test]
fn three_items_expand_without_leftover_markers() {
    let template = build_template(orders_template);
    let bytes = render(&template, &orders_data(), RenderConfig::default());

    let book = read_output(&bytes);
    let sheet = book.get_sheet_by_name("Sheet1").expect("Sheet1");
    assert_eq!(value(sheet, "A1"), "Report: Q3");
    assert_eq!(value(sheet, "B1"), "Header");
    assert_eq!(value(sheet, "A2"), "");
    assert_eq!(value(sheet, "A3"), "Apples");
    assert_eq!(value(sheet, "A4"), "Pears");
    assert_eq!(value(sheet, "A5"), "Plums");
    assert_eq!(value(sheet, "B5"), "3");
    assert_eq!(formula(sheet, "C3"), "B3*2");
    assert_eq!(formula(sheet, "C5"), "B5*2");
    assert_eq!(value(sheet, "A6"), "Total");
    assert_eq!(formula(sheet, "B6"), "SUM(B3:B5)");

    assert!(!all_xml(&bytes).contains("${"), "marker text left in output");
    assert!(!part_names(&bytes).iter().any(|p| p == "xl/calcChain.xml"));
    let workbook = part_text(&bytes, "xl/workbook.xml").expect("workbook part");
    assert!(workbook.contains(r#"fullCalcOnLoad="1""#));
}

#[test]
fn side_by_side_regions_share_one_band() {
    let template = build_template(|book| {
        let sheet = sheet1(book);
        sheet.get_cell_mut("A1").set_value("${repeat(left, A2:B2, l)}Left");
        sheet.get_cell_mut("D1").set_value("${repeat(right, D2:E2, r)}Right");
        sheet.get_cell_mut("A2").set_value("${l.name}");
        sheet.get_cell_mut("B2").set_value("${l.v}");
        sheet.get_cell_mut("D2").set_value("${r.name}");
        sheet.get_cell_mut("E2").set_value("${r.v}");
    });
    let left: Vec<_> = (0..5).map(|i| json!({"name": format!("L{i}"), "v": i})).collect();
    let right: Vec<_> = (0..4).map(|i| json!({"name": format!("R{i}"), "v": i})).collect();
    let data = MapDataSource::new()
        .with_collection("left", left)
        .with_collection("right", right);
    let bytes = render(&template, &data, RenderConfig::default());

    let book = read_output(&bytes);
    let sheet = book.get_sheet_by_name("Sheet1").expect("Sheet1");
    assert_eq!(sheet.get_highest_row(), 6);
    assert_eq!(value(sheet, "A1"), "Left");
    assert_eq!(value(sheet, "D1"), "Right");
    for (i, row) in (2..=6).enumerate() {
        assert_eq!(value(sheet, &format!("A{row}")), format!("L{i}"));
    }
    assert_eq!(value(sheet, "D5"), "R3");
    assert_eq!(value(sheet, "D6"), "");
    assert_eq!(value(sheet, "E6"), "");
}

#[test]
fn right_regions_add_columns() {
    let template = build_template(|book| {
        let sheet = sheet1(book);
        sheet.get_cell_mut("A1").set_value("Quarter");
        sheet.get_cell_mut("B1").set_value("${q}");
        sheet.get_cell_mut("C1").set_value("Total");
        sheet.get_cell_mut("A3").set_value("${repeat(quarters, B1:B1, q, right)}");
    });
    let data = MapDataSource::new().with_collection("quarters", vec![json!("Q1"), json!("Q2"), json!("Q3")]);
    let bytes = render(&template, &data, RenderConfig::default());

    let book = read_output(&bytes);
    let sheet = book.get_sheet_by_name("Sheet1").expect("Sheet1");
    assert_eq!(value(sheet, "A1"), "Quarter");
    assert_eq!(value(sheet, "B1"), "Q1");
    assert_eq!(value(sheet, "C1"), "Q2");
    assert_eq!(value(sheet, "D1"), "Q3");
    assert_eq!(value(sheet, "E1"), "Total");
    assert_eq!(value(sheet, "A3"), "");
}

#[test]
fn empty_collection_uses_the_empty_range() {
    let template = build_template(|book| {
        let sheet = sheet1(book);
        sheet.get_cell_mut("A1").set_value("Orders");
        sheet.get_cell_mut("C1").set_value("${repeat(orders, A2:B2, o, down, A5:B5)}");
        sheet.get_cell_mut("A2").set_value("${o.id}");
        sheet.get_cell_mut("B2").set_value("${o.total}");
        sheet.get_cell_mut("A3").set_value("End");
        sheet.get_cell_mut("A5").set_value("No orders");
    });

    let empty = MapDataSource::new().with_collection("orders", Vec::new());
    let bytes = render(&template, &empty, RenderConfig::default());
    let book = read_output(&bytes);
    let sheet = book.get_sheet_by_name("Sheet1").expect("Sheet1");
    assert_eq!(value(sheet, "A2"), "No orders");
    assert_eq!(value(sheet, "A3"), "End");
    assert_eq!(value(sheet, "A5"), "");

    let two = MapDataSource::new().with_collection(
        "orders",
        vec![json!({"id": "o-1", "total": 5}), json!({"id": "o-2", "total": 7})],
    );
    let bytes = render(&template, &two, RenderConfig::default());
    let book = read_output(&bytes);
    let sheet = book.get_sheet_by_name("Sheet1").expect("Sheet1");
    assert_eq!(value(sheet, "A2"), "o-1");
    assert_eq!(value(sheet, "A3"), "o-2");
    assert_eq!(value(sheet, "A4"), "End");
    assert_eq!(value(sheet, "A6"), "");
}

#[test]
fn numeric_values_get_a_number_format_on_general_cells() {
    let template = build_template(|book| {
        let sheet = sheet1(book);
        sheet.get_cell_mut("A1").set_value("${repeat(items, A2:B2, item)}");
        sheet.get_cell_mut("A2").set_value("${item.qty}");
        sheet.get_cell_mut("B2").set_value("${item.price}");
    });
    let data = MapDataSource::new().with_collection(
        "items",
        vec![json!({"qty": 4, "price": 2.5}), json!({"qty": 6, "price": 1.25})],
    );
    let bytes = render(&template, &data, RenderConfig::default());
    assert_eq!(cell_num_fmt(&bytes, SHEET1, "A2"), Some(1));
    assert_eq!(cell_num_fmt(&bytes, SHEET1, "B3"), Some(2));

    let book = read_output(&bytes);
    let sheet = book.get_sheet_by_name("Sheet1").expect("Sheet1");
    assert_eq!(value(sheet, "A3"), "6");
    assert_eq!(value(sheet, "B2"), "2.5");
}

#[test]
fn merges_are_replicated_and_shifted() {
    let template = build_template(|book| {
        let sheet = sheet1(book);
        sheet.get_cell_mut("A1").set_value("${repeat(items, A2:B2, item)}");
        sheet.get_cell_mut("A2").set_value("${item.name}");
        sheet.add_merge_cells("A2:B2");
        sheet.get_cell_mut("A3").set_value("Footer");
        sheet.add_merge_cells("A3:B3");
    });
    let bytes = render(&template, &orders_data(), RenderConfig::default());
    let book = read_output(&bytes);
    let sheet = book.get_sheet_by_name("Sheet1").expect("Sheet1");
    assert_eq!(merges(sheet), vec!["A2:B2", "A3:B3", "A4:B4", "A5:B5"]);
    assert_eq!(value(sheet, "A5"), "Footer");
}

#[test]
fn formulas_on_other_sheets_follow_the_expansion() {
    let template = build_template(|book| {
        orders_template(book);
        let summary = book.new_sheet("Summary").expect("new sheet");
        summary.get_cell_mut("A1").set_formula("SUM(Sheet1!B3:B3)");
        summary.get_cell_mut("A2").set_formula("Sheet1!B4");
    });
    let bytes = render(&template, &orders_data(), RenderConfig::default());
    let book = read_output(&bytes);
    let summary = book.get_sheet_by_name("Summary").expect("Summary");
    assert_eq!(formula(summary, "A1"), "SUM(Sheet1!B3:B5)");
    assert_eq!(formula(summary, "A2"), "Sheet1!B6");
}

#[test]
fn streaming_and_memory_produce_the_same_sheets() {
    let template = build_template(orders_template);
    let data = orders_data();
    let memory = engine(RenderConfig::builder().streaming(StreamingMode::Off).build());
    let streaming = engine(
        RenderConfig::builder()
            .streaming(StreamingMode::On)
            .streaming_window_rows(2)
            .build(),
    );

    let (memory_bytes, memory_report) = memory
        .render_with(&template, &data, Default::default())
        .expect("memory render");
    let (stream_bytes, stream_report) = streaming
        .render_with(&template, &data, Default::default())
        .expect("streaming render");

    assert_eq!(memory_report.mode, RenderMode::Memory);
    assert_eq!(stream_report.mode, RenderMode::Streaming);
    assert_eq!(memory_report.rows, stream_report.rows);
    for part in [SHEET1, "xl/styles.xml", "xl/sharedStrings.xml"] {
        assert_eq!(part_text(&memory_bytes, part), part_text(&stream_bytes, part), "{part}");
    }
}

#[test]
fn auto_mode_streams_above_the_threshold() {
    let template = build_template(orders_template);
    let config = RenderConfig::builder().streaming_threshold_rows(3).build();
    let (_, report) = engine(config)
        .render_with(&template, &orders_data(), Default::default())
        .expect("render");
    assert_eq!(report.mode, RenderMode::Streaming);
    assert_eq!(report.planned_rows, 6);
}

#[test]
fn metadata_and_images_are_written() {
    let template = build_template(|book| {
        let sheet = sheet1(book);
        sheet.get_cell_mut("A1").set_value("${title}");
        sheet.get_cell_mut("C1").set_value("${image.logo}");
    });
    let data = MapDataSource::new()
        .with_value("title", "Invoice")
        .with_image("logo", ImageData::from_bytes(support::PIXEL_PNG.to_vec()).expect("png"))
        .with_metadata(DocumentMetadata {
            title: Some("Invoice 42".into()),
            creator: Some("Billing".into()),
            ..DocumentMetadata::default()
        });
    let (bytes, report) = engine(RenderConfig::default())
        .render_with(&template, &data, Default::default())
        .expect("render");
    assert_eq!(report.images, 1);

    let names = part_names(&bytes);
    assert!(names.iter().any(|n| n.starts_with("xl/media/") && n.ends_with(".png")));
    assert!(names.iter().any(|n| n.starts_with("xl/drawings/drawing")));
    let sheet_xml = part_text(&bytes, SHEET1).expect("sheet part");
    assert!(sheet_xml.contains("<drawing "));
    assert!(sheet_xml.contains(r#"r:id="rIdTplDrawing1""#));

    let core = part_text(&bytes, "docProps/core.xml").expect("core part");
    assert!(core.contains("<dc:title>Invoice 42</dc:title>"));
    assert!(core.contains("<dc:creator>Billing</dc:creator>"));
}

#[test]
fn control_characters_in_values_are_encoded() {
    let template = build_template(|book| {
        let sheet = sheet1(book);
        sheet.get_cell_mut("A1").set_value("${title}");
        sheet.get_cell_mut("A2").set_value("${repeat(rows, A3:A3, r)}");
        sheet.get_cell_mut("A3").set_value("${r.label}");
    });
    let data = MapDataSource::new()
        .with_value("title", "a\u{1}b\u{0}c")
        .with_collection("rows", vec![json!({"label": "x\u{1f}y"}), json!({"label": "_x0041_"})]);
    for mode in [StreamingMode::Off, StreamingMode::On] {
        let bytes = engine(RenderConfig::builder().streaming(mode).build())
            .render(&template, &data)
            .expect("render");
        let xml = part_text(&bytes, SHEET1).expect("sheet part");
        assert!(!xml.chars().any(|c| c < ' ' && !matches!(c, '\t' | '\n' | '\r')));
        assert!(xml.contains("a_x0001_b_x0000_c"));
        assert!(xml.contains("x_x001F_y"));
        assert!(xml.contains("_x005F_x0041_"));
    }
}

#[test]
fn one_template_serves_concurrent_renderings() {
    let template = build_template(orders_template);
    let engine = engine(RenderConfig::default());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let template = Arc::clone(&template);
            let engine = engine.clone();
            std::thread::spawn(move || {
                let data = MapDataSource::new()
                    .with_value("title", format!("run {i}"))
                    .with_collection("items", vec![json!({"name": "x", "qty": i}); i + 1]);
                engine.render(&template, &data).expect("render")
            })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        let bytes = handle.join().expect("thread");
        let book = read_output(&bytes);
        let sheet = book.get_sheet_by_name("Sheet1").expect("Sheet1");
        assert_eq!(value(sheet, "A1"), format!("Report: run {i}"));
        assert_eq!(value(sheet, &format!("A{}", 4 + i)), "Total");
    }
}
