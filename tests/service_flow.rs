mod common;

use common::fixtures::{
  RunningServer, png_base64, png_bytes, save_png, ship_service, square_scene,
};
use orbital_eye::geo::GeoPoint;
use orbital_eye::raster::ImageRef;
use orbital_eye::service::{ChangeRequest, Code, DetectRequest};
use serde_json::json;

#[test]
fn detect_from_file_with_geo_reference() {
  let (service, _dir) = ship_service();
  let image = save_png(&square_scene(64, None));

  let response = service
    .detect(DetectRequest {
      image: ImageRef::from_path(image.path().to_string_lossy()),
      target_classes: vec!["vessels".into()],
      confidence_threshold: 0.5,
      gsd_meters: 111.32,
      top_left: Some(GeoPoint::new(0.0, 0.0)),
    })
    .unwrap();

  assert_eq!(response.model_version, "test-vessels");
  assert_eq!(response.detections.len(), 1);
  let ship = &response.detections[0];
  assert_eq!(ship.class_name, "ship");
  assert_eq!(ship.bbox, [10.0, 20.0, 30.0, 25.0]);
  let center = ship.geo_center.unwrap();
  assert!((center.longitude - 0.02).abs() < 1e-9);
  assert!((center.latitude + 0.0225).abs() < 1e-9);
  assert!((ship.estimated_length_m.unwrap() - 2226.4).abs() < 0.1);

  assert_eq!(service.health().loaded_models, vec!["vessels".to_string()]);
}

#[test]
fn high_threshold_returns_no_detections() {
  let (service, _dir) = ship_service();
  let response = service
    .detect(DetectRequest {
      image: ImageRef::from_bytes(png_bytes(&square_scene(32, None))),
      confidence_threshold: 0.9,
      ..Default::default()
    })
    .unwrap();
  assert!(response.detections.is_empty());
  assert_eq!(response.model_version, "test-general");
}

#[test]
fn corrupt_bytes_are_invalid_argument() {
  let (service, _dir) = ship_service();
  let err = service
    .detect(DetectRequest {
      image: ImageRef::from_bytes(vec![0x42; 64]),
      ..Default::default()
    })
    .unwrap_err();
  assert_eq!(err.code, Code::InvalidArgument);
  assert!(service.health().loaded_models.is_empty());
}

#[test]
fn change_between_files() {
  let (service, _dir) = ship_service();
  let before = save_png(&square_scene(100, None));
  let after = save_png(&square_scene(100, Some((25, 25, 50))));

  let response = service
    .detect_changes(ChangeRequest {
      before: ImageRef::from_path(before.path().to_string_lossy()),
      after: ImageRef::from_path(after.path().to_string_lossy()),
      sensitivity: 0.5,
    })
    .unwrap();

  assert!((response.change_percentage - 25.0).abs() < 0.5);
  assert_eq!(response.regions.len(), 1);
  assert_eq!((response.mask_width, response.mask_height), (100, 100));
  let mask = image::load_from_memory(&response.change_mask).unwrap();
  assert_eq!((mask.width(), mask.height()), (100, 100));
}

#[test]
fn transport_round_trip() {
  let server = RunningServer::start();
  let mut client = server.connect();

  let health = client.call(&json!({"op": "health"}));
  assert_eq!(health["ok"]["ready"], true);
  assert_eq!(health["ok"]["device"], "cpu");

  let image = png_base64(&square_scene(32, None));
  let reply = client.call(&json!({
    "op": "detect",
    "image": {"data": image},
    "target_classes": ["aircraft"],
  }));
  assert_eq!(reply["ok"]["model_version"], "test-aircraft");
  assert_eq!(reply["ok"]["detections"][0]["class_name"], "ship");
  assert!(reply["ok"]["detections"][0].get("geo_center").is_none());

  let before = png_base64(&square_scene(100, None));
  let after = png_base64(&square_scene(100, Some((25, 25, 50))));
  let reply = client.call(&json!({
    "op": "detect_changes",
    "before": {"data": before},
    "after": {"data": after},
    "sensitivity": 0.5,
  }));
  assert_eq!(reply["ok"]["regions"][0]["change_type"], "activity_change");
  let mask = {
    use base64::Engine;
    let text = reply["ok"]["change_mask"].as_str().expect("mask is a base64 string");
    base64::engine::general_purpose::STANDARD.decode(text).unwrap()
  };
  let mask = image::load_from_memory(&mask).unwrap();
  assert_eq!((mask.width(), mask.height()), (100, 100));

  let reply = client.call(&json!({"op": "enhance", "image": {"path": "x.png"}, "scale_factor": 4}));
  assert_eq!(reply["error"]["code"], "unimplemented");

  // 连接在错误之后仍然可用
  let reply = client.call(&json!({"op": "detect", "image": {}}));
  assert_eq!(reply["error"]["code"], "invalid_argument");
  let reply = client.call_raw(b"not json\n");
  assert_eq!(reply["error"]["code"], "invalid_argument");

  let health = client.call(&json!({"op": "health"}));
  assert_eq!(health["ok"]["loaded_models"], json!(["aircraft"]));
}

#[test]
fn concurrent_clients_share_one_load() {
  let server = RunningServer::start();
  let image = png_base64(&square_scene(16, None));

  std::thread::scope(|scope| {
    for _ in 0..4 {
      let mut client = server.connect();
      let image = image.clone();
      scope.spawn(move || {
        let reply = client.call(&json!({
          "op": "detect",
          "image": {"data": image},
          "target_classes": ["vehicles"],
        }));
        assert_eq!(reply["ok"]["model_version"], "test-vehicles");
      });
    }
  });

  let health = server.connect().call(&json!({"op": "health"}));
  assert_eq!(health["ok"]["loaded_models"], json!(["vehicles"]));
}
