fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    ///
    /// Fixtures are captured verbatim from the Node backend and the browser
    /// uploader, so a mismatch here means the Rust types drifted from the
    /// wire format, not that a fixture went stale.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Normalizes JSON values so that integer-valued floats compare equal.
    ///
    /// JavaScript's `JSON.stringify` prints whole floats as `65`, Rust
    /// serializes `f64` as `65.0`. Both are semantically identical. This
    /// function normalizes numbers so that `65` and `65.0` compare as equal.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => {
                // If it's representable as f64, use f64 (normalizes int vs float)
                if let Some(f) = n.as_f64() {
                    serde_json::json!(f)
                } else {
                    v.clone()
                }
            }
            serde_json::Value::Object(map) => {
                let normalized: serde_json::Map<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect();
                serde_json::Value::Object(normalized)
            }
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (order-independent, float-normalized comparison).
    fn roundtrip_test<T>(name: &str)
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        let norm_fixture = normalize_value(&fixture);
        let norm_reserialized = normalize_value(&reserialized);
        assert_eq!(
            norm_fixture, norm_reserialized,
            "roundtrip mismatch for {name}:\n  backend: {fixture}\n  Rust:    {reserialized}"
        );
    }

    // --- Backend API payloads ---

    #[test]
    fn fixture_upload_session() {
        roundtrip_test::<partway_protocol::UploadSession>("upload_session.json");
    }

    #[test]
    fn fixture_create_session_request() {
        roundtrip_test::<partway_protocol::CreateSessionRequest>("create_session_request.json");
    }

    #[test]
    fn fixture_presign_parts_request() {
        roundtrip_test::<partway_protocol::PresignPartsRequest>("presign_parts_request.json");
    }

    #[test]
    fn fixture_complete_upload_request() {
        roundtrip_test::<partway_protocol::CompleteUploadRequest>("complete_upload_request.json");
    }

    #[test]
    fn fixture_completed_upload() {
        roundtrip_test::<partway_protocol::CompletedUpload>("completed_upload.json");
    }

    #[test]
    fn fixture_session_status() {
        roundtrip_test::<partway_protocol::SessionStatus>("session_status.json");
    }

    // --- Subscriber events ---

    #[test]
    fn fixture_upload_progress() {
        roundtrip_test::<partway_protocol::UploadProgress>("upload_progress.json");
    }

    #[test]
    fn fixture_upload_event_progress() {
        roundtrip_test::<partway_protocol::UploadEvent>("upload_event_progress.json");
    }

    #[test]
    fn fixture_upload_event_error() {
        roundtrip_test::<partway_protocol::UploadEvent>("upload_event_error.json");
    }

    #[test]
    fn fixture_upload_event_complete() {
        roundtrip_test::<partway_protocol::UploadEvent>("upload_event_complete.json");
    }

    // --- Persisted resume records ---

    #[test]
    fn fixture_session_record() {
        roundtrip_test::<partway_resume::StoredSession>("session_record.json");
    }

    // --- Part arithmetic ---

    #[test]
    fn fixture_part_layout() {
        // Pins the part split against the backend's Math.ceil arithmetic.
        let fixture = load_fixture("part_layout.json");
        let size = fixture["size"].as_u64().unwrap();
        let part_size = fixture["partSize"].as_u64().unwrap();
        let expected_parts = fixture["totalParts"].as_u64().unwrap() as u32;
        let expected_last = fixture["lastPartLen"].as_u64().unwrap();

        let session: partway_protocol::UploadSession = serde_json::from_value(serde_json::json!({
            "id": "layout",
            "bucket": "b",
            "key": "k",
            "uploadId": "u",
            "size": size,
            "partSize": part_size,
            "createdAt": 0
        }))
        .unwrap();

        assert_eq!(
            session.total_parts(),
            expected_parts,
            "part count mismatch: size={size}, partSize={part_size}"
        );
        assert_eq!(
            session.part_len(expected_parts),
            expected_last,
            "last part length mismatch: size={size}, partSize={part_size}"
        );
    }

    // --- Backward compatibility: fields the backend may omit ---

    #[test]
    fn legacy_session_without_optional_fields() {
        // Early backend builds sent neither presignedParts nor filename.
        let json = r#"{
            "id": "abc123",
            "bucket": "demo-bucket",
            "key": "uploads/abc123/file.bin",
            "uploadId": "mp-1",
            "size": 1048576,
            "partSize": 8388608,
            "createdAt": 1700000000000
        }"#;
        let session: partway_protocol::UploadSession = serde_json::from_str(json).unwrap();
        assert!(
            session.presigned_parts.is_empty(),
            "missing presignedParts should default to empty vec"
        );
        assert!(session.filename.is_none(), "missing filename should default to None");
    }

    #[test]
    fn legacy_status_without_parts_listing() {
        // A session with nothing uploaded yet has no parts array at all.
        let json = r#"{
            "id": "abc123",
            "key": "uploads/abc123/file.bin",
            "uploadId": "mp-1"
        }"#;
        let status: partway_protocol::SessionStatus = serde_json::from_str(json).unwrap();
        assert!(
            status.parts.is_empty(),
            "missing parts should default to empty vec"
        );
    }

    #[test]
    fn legacy_progress_without_eta() {
        // JSON.stringify drops undefined fields, so etaSeconds and
        // lastPartCompleted may be absent rather than null.
        let json = r#"{
            "sessionId": "abc123",
            "filename": "file.bin",
            "bytesUploaded": 0,
            "totalBytes": 1048576,
            "percent": 0,
            "speedBps": 0,
            "state": "preparing",
            "startedAt": 1700000000000
        }"#;
        let progress: partway_protocol::UploadProgress = serde_json::from_str(json).unwrap();
        assert!(
            progress.eta_seconds.is_none(),
            "missing etaSeconds should default to None"
        );
        assert!(
            progress.last_part_completed.is_none(),
            "missing lastPartCompleted should default to None"
        );
    }
}
