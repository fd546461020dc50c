use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb, Rgba};
use serde_json::json;
use shutter_host_core::catalog::CatalogRecord;
use shutter_host_core::pipeline::vision::{prepare_vision_payloads, PROGRESS_LABEL};

fn temp_dir(label: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time should be after epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("shutter_vision_it_{label}_{stamp}"));
    fs::create_dir_all(&dir).expect("temp dir should be created");
    dir
}

fn write_png(path: &Path, width: u32, height: u32) {
    let img = ImageBuffer::from_pixel(width, height, Rgba([200u8, 120, 40, 255]));
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut bytes, ImageFormat::Png)
        .expect("png should encode");
    fs::write(path, bytes.into_inner()).expect("png should be written");
}

fn record(id: i64, dir: &Path, filename: &str) -> CatalogRecord {
    CatalogRecord::from_value(json!({
        "id": id,
        "path": dir.display().to_string(),
        "filename": filename,
        "rating": 1,
    }))
    .expect("record should be an object")
}

fn decode(base64: &str) -> DynamicImage {
    let bytes = BASE64_STANDARD
        .decode(base64.as_bytes())
        .expect("payload should be base64");
    image::load_from_memory(bytes.as_slice()).expect("payload should decode")
}

#[test]
fn missing_files_are_collected_and_order_is_kept() {
    let dir = temp_dir("order");
    let missing = [2i64, 5, 9];
    let records: Vec<CatalogRecord> = (0..10)
        .map(|id| {
            let filename = format!("img_{id}.png");
            if !missing.contains(&id) {
                write_png(&dir.join(&filename), 16 + id as u32, 16);
            }
            record(id, &dir, &filename)
        })
        .collect();

    let batch = prepare_vision_payloads(&records, true, 4, None);

    assert_eq!(batch.payloads.len(), 7);
    assert_eq!(batch.errors.len(), 3);
    let ids: Vec<i64> = batch
        .payloads
        .iter()
        .map(|payload| payload.source.id().expect("payload should keep its id"))
        .collect();
    assert_eq!(ids, vec![0, 1, 3, 4, 6, 7, 8]);
    for (error, id) in batch.errors.iter().zip(missing) {
        assert_eq!(
            error,
            &format!("file not found: {}", dir.join(format!("img_{id}.png")).display())
        );
    }
    let total: usize = batch.payloads.iter().map(|p| p.base64.len()).sum();
    assert_eq!(batch.encoded_bytes, total);
}

#[test]
fn pool_width_does_not_change_the_result() {
    let dir = temp_dir("widths");
    let records: Vec<CatalogRecord> = (0..6)
        .map(|id| {
            let filename = format!("w_{id}.png");
            write_png(&dir.join(&filename), 8, 8 + id as u32);
            record(id, &dir, &filename)
        })
        .collect();

    let single = prepare_vision_payloads(&records, true, 1, None);
    let wide = prepare_vision_payloads(&records, true, 16, None);

    let single_ids: Vec<Option<i64>> = single.payloads.iter().map(|p| p.source.id()).collect();
    let wide_ids: Vec<Option<i64>> = wide.payloads.iter().map(|p| p.source.id()).collect();
    assert_eq!(single_ids, wide_ids);
    assert_eq!(
        single.payloads.iter().map(|p| p.base64.clone()).collect::<Vec<_>>(),
        wide.payloads.iter().map(|p| p.base64.clone()).collect::<Vec<_>>()
    );
}

#[test]
fn text_only_is_empty_for_any_pool_size() {
    let dir = temp_dir("text_only");
    let records: Vec<CatalogRecord> = (0..3).map(|id| record(id, &dir, "x.png")).collect();

    for workers in [0, 1, 4, 64] {
        let batch = prepare_vision_payloads(&records, false, workers, None);
        assert!(batch.payloads.is_empty());
        assert!(batch.errors.is_empty());
    }
}

#[test]
fn large_images_are_downscaled_and_decodable() {
    let dir = temp_dir("downscale");
    let img = ImageBuffer::from_pixel(2000, 1000, Rgb([10u8, 200, 30]));
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut bytes, ImageFormat::Png)
        .expect("png should encode");
    fs::write(dir.join("wide.png"), bytes.into_inner()).expect("png should be written");
    let records = vec![record(1, &dir, "wide.png")];

    let batch = prepare_vision_payloads(&records, true, 2, None);

    let payload = &batch.payloads[0];
    assert_eq!(payload.mime, "image/jpeg");
    assert!(payload.transcoded);
    assert_eq!(payload.path, dir.join("wide.png"));
    let decoded = decode(&payload.base64);
    assert_eq!((decoded.width(), decoded.height()), (1600, 800));
    let pixel = decoded.to_rgb8().get_pixel(800, 400).0;
    assert!(pixel[1] > 150 && pixel[0] < 60 && pixel[2] < 80);
}

#[test]
fn undecodable_files_fall_back_to_raw_bytes() {
    let dir = temp_dir("raw");
    fs::write(dir.join("shot.cr3"), b"\x00\x01raw sensor data").expect("raw should be written");
    fs::write(dir.join("broken.webp"), b"RIFF....WEBPbroken").expect("webp should be written");
    let records = vec![record(1, &dir, "shot.cr3"), record(2, &dir, "broken.webp")];

    let batch = prepare_vision_payloads(&records, true, 2, None);

    assert!(batch.errors.is_empty());
    assert!(batch.payloads.iter().all(|payload| !payload.transcoded));
    assert_eq!(
        batch.payloads[0].base64,
        BASE64_STANDARD.encode(b"\x00\x01raw sensor data")
    );
    assert_eq!(batch.payloads[0].mime, "image/jpeg");
    assert_eq!(batch.payloads[1].mime, "image/webp");
    assert!(batch.payloads[1].data_url.starts_with("data:image/webp;base64,"));
}

#[test]
fn progress_fires_on_first_every_third_and_last() {
    let dir = temp_dir("progress");
    let records: Vec<CatalogRecord> = (0..10)
        .map(|id| record(id, &dir, &format!("missing_{id}.png")))
        .collect();
    let seen = Mutex::new(Vec::new());
    let progress = |completed: usize, total: usize, label: &str| {
        assert_eq!(total, 10);
        assert_eq!(label, PROGRESS_LABEL);
        seen.lock()
            .expect("progress lock should not be poisoned")
            .push(completed);
    };

    let batch = prepare_vision_payloads(&records, true, 3, Some(&progress));

    assert_eq!(batch.errors.len(), 10);
    let mut calls = seen.into_inner().expect("progress lock should not be poisoned");
    calls.sort_unstable();
    assert_eq!(calls, vec![1, 3, 6, 9, 10]);
}
