use smap_adapters::Normalizer;
use smap_core::{DocumentFormat, PrimitiveType};

fn fixture(name: &str) -> Vec<u8> {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    std::fs::read(root.join("fixtures/documents").join(name)).expect("fixture readable")
}

#[test]
fn personal_auto_xml_fixture_normalizes() {
    let doc = Normalizer::default()
        .normalize(&fixture("personal_auto.xml"), None)
        .expect("normalize");
    assert_eq!(doc.format, DocumentFormat::Xml);
    assert_eq!(doc.product.product_code.as_deref(), Some("PA001"));
    assert!(doc.node("/PolicyDocument/Driver[2]/Name").is_some());
    assert!(doc.node("/PolicyDocument/Vehicle/@VehicleIdentificationNum").is_some());
    assert_eq!(
        doc.node("/PolicyDocument/Policy/EffectiveDate").map(|n| n.data_type),
        Some(PrimitiveType::Date)
    );
}

#[test]
fn homeowners_json_fixture_normalizes() {
    let doc = Normalizer::default()
        .normalize(&fixture("homeowners.json"), None)
        .expect("normalize");
    assert_eq!(doc.format, DocumentFormat::Json);
    assert_eq!(doc.product.product_code.as_deref(), Some("HO003"));
    assert_eq!(
        doc.node("/coverages[2]/limit").and_then(|n| n.sample_value()),
        Some("41500")
    );
}

#[test]
fn workers_comp_csv_fixture_normalizes() {
    let doc = Normalizer::default()
        .normalize(&fixture("workers_comp.csv"), Some(DocumentFormat::Csv))
        .expect("normalize");
    assert_eq!(doc.leaves().count(), 6);
    assert_eq!(doc.node("/payroll_amount").map(|n| n.data_type), Some(PrimitiveType::Decimal));
    assert_eq!(doc.node("/employee_count").map(|n| n.data_type), Some(PrimitiveType::Integer));
    assert_eq!(doc.node("/active").map(|n| n.data_type), Some(PrimitiveType::Boolean));
    assert_eq!(doc.product.product_code.as_deref(), Some("WC001"));
}
