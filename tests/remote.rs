//! End-to-end scenarios: the full state machine driven over in-memory
//! protocol pipes, with a mock Dataverse answering the HTTP side. The host
//! half of each conversation is scripted as the exact reply lines the
//! remote will consume, in order.

use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dataverse_annex::mangle::{mangle_path, split_label};
use dataverse_annex::protocol::AnnexIo;
use dataverse_annex::remote::DataverseRemote;

const DOI: &str = "doi:10.5072/FK2/WQCBX1";
const KEY: &str = "SHA256E-s7--abc.txt";
const DIRHASH: &str = "f87/4d5/";

fn ok_body(data: serde_json::Value) -> serde_json::Value {
    json!({"status": "OK", "data": data})
}

fn file_entry(id: i64, dir: Option<&str>, name: &str) -> serde_json::Value {
    let mut entry = json!({"label": name, "dataFile": {"id": id, "filename": name}});
    if let Some(dir) = dir {
        entry["directoryLabel"] = json!(dir);
    }
    entry
}

fn version(state: &str, files: Vec<serde_json::Value>) -> serde_json::Value {
    json!({"versionState": state, "files": files})
}

/// The record Dataverse would hold for KEY in regular mode: the key path
/// mangled (annex keys carry dashes, so the filename gets escaped).
fn key_entry(id: i64) -> serde_json::Value {
    let mangled = mangle_path(&format!("annex/{DIRHASH}{KEY}"));
    let (dir, name) = split_label(&mangled);
    file_entry(id, dir, name)
}

async fn mount_info(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/info/version"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "OK", "data": {"version": "6.1"}})),
        )
        .mount(server)
        .await;
}

async fn mount_latest(server: &MockServer, latest: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/api/datasets/:persistentId/"))
        .and(query_param("persistentId", DOI))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(ok_body(json!({"latestVersion": latest}))),
        )
        .mount(server)
        .await;
}

async fn mount_versions(server: &MockServer, versions: Vec<serde_json::Value>) {
    Mock::given(method("GET"))
        .and(path("/api/datasets/:persistentId/versions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(json!(versions))))
        .mount(server)
        .await;
}

/// Host-side lines for a successful PREPARE: the four config values, the
/// git dir, and a stored token.
fn prepare_lines(url: &str) -> String {
    format!(
        "PREPARE\nVALUE {url}\nVALUE {DOI}\nVALUE\nVALUE\nVALUE /nonexistent/.git\nCREDS test-token \n"
    )
}

/// Run the serve loop over a scripted host transcript; returns the serve
/// result and everything the remote wrote.
async fn run_remote(input: String) -> (Result<(), dataverse_annex::error::RemoteError>, String) {
    // The transcripts assume token discovery falls through to GETCREDS.
    unsafe { std::env::remove_var("DATAVERSE_API_TOKEN") };
    let annex = AnnexIo::new(tokio::io::BufReader::new(std::io::Cursor::new(input.into_bytes())), Vec::new());
    let mut remote = DataverseRemote::new(annex);
    let result = remote.serve().await;
    let (_, out) = remote.into_annex().into_parts();
    (result, String::from_utf8(out).unwrap())
}

/// Assert the expected lines appear in the output in this order. Other
/// lines (queries, DEBUG) may interleave.
fn assert_lines_in_order<S: AsRef<str>>(output: &str, expected: &[S]) {
    let mut lines = output.lines();
    for wanted in expected {
        let wanted = wanted.as_ref();
        assert!(
            lines.any(|l| l == wanted),
            "missing (or out of order) line {wanted:?} in output:\n{output}"
        );
    }
}

fn temp_content(content: &[u8]) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), content).unwrap();
    file
}

// ---------------------------------------------------------------------------
// Regular mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn round_trip_store_retrieve_remove() {
    let server = MockServer::start().await;
    mount_info(&server).await;
    mount_latest(&server, version("DRAFT", vec![])).await;
    Mock::given(method("POST"))
        .and(path("/api/datasets/:persistentId/add"))
        .and(query_param("persistentId", DOI))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(ok_body(json!({"files": [key_entry(101)]}))),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/access/datafile/101"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello\n".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/dvn/api/data-deposit/v1.1/swordv2/edit-media/file/101"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    mount_versions(&server, vec![version("DRAFT", vec![])]).await;

    let store_file = temp_content(b"hello\n");
    let out_dir = tempfile::tempdir().unwrap();
    let out_file = out_dir.path().join("retrieved");

    let input = format!(
        "{prepare}\
         TRANSFER STORE {KEY} {store}\n\
         VALUE {DIRHASH}\n\
         VALUE\n\
         CHECKPRESENT {KEY}\n\
         VALUE 101\n\
         TRANSFER RETRIEVE {KEY} {retrieve}\n\
         VALUE 101\n\
         REMOVE {KEY}\n\
         VALUE 101\n\
         VALUE {DIRHASH}\n\
         VALUE 101\n\
         CHECKPRESENT {KEY}\n\
         VALUE\n\
         VALUE {DIRHASH}\n",
        prepare = prepare_lines(&server.uri()),
        store = store_file.path().display(),
        retrieve = out_file.display(),
    );

    let (result, output) = run_remote(input).await;
    result.unwrap();

    assert_lines_in_order(
        &output,
        &[
            "VERSION 1".to_string(),
            "PREPARE-SUCCESS".to_string(),
            format!("SETSTATE {KEY} 101"),
            format!("TRANSFER-SUCCESS STORE {KEY}"),
            format!("CHECKPRESENT-SUCCESS {KEY}"),
            format!("TRANSFER-SUCCESS RETRIEVE {KEY}"),
            format!("SETSTATE {KEY} "),
            format!("REMOVE-SUCCESS {KEY}"),
            format!("CHECKPRESENT-FAILURE {KEY}"),
        ],
    );
    assert_eq!(std::fs::read(&out_file).unwrap(), b"hello\n");
}

#[tokio::test]
async fn store_over_a_released_file_keeps_both_ids_bound() {
    let server = MockServer::start().await;
    mount_info(&server).await;
    mount_latest(&server, version("RELEASED", vec![key_entry(7)])).await;
    Mock::given(method("POST"))
        .and(path("/api/files/7/replace"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(ok_body(json!({"files": [key_entry(8)]}))),
        )
        .mount(&server)
        .await;
    mount_versions(
        &server,
        vec![
            json!({"versionState": "RELEASED", "versionNumber": 1, "versionMinorNumber": 0,
                   "files": [key_entry(7)]}),
            version("DRAFT", vec![key_entry(8)]),
        ],
    )
    .await;

    let store_file = temp_content(b"new content");
    let input = format!(
        "{prepare}\
         TRANSFER STORE {KEY} {store}\n\
         VALUE {DIRHASH}\n\
         VALUE 7\n\
         CHECKPRESENT {KEY}\n\
         VALUE 7,8\n",
        prepare = prepare_lines(&server.uri()),
        store = store_file.path().display(),
    );

    let (result, output) = run_remote(input).await;
    result.unwrap();

    // The released id 7 stays bound alongside the new draft id 8.
    assert_lines_in_order(
        &output,
        &[
            format!("SETSTATE {KEY} 7,8"),
            format!("TRANSFER-SUCCESS STORE {KEY}"),
            format!("CHECKPRESENT-SUCCESS {KEY}"),
        ],
    );
}

#[tokio::test]
async fn store_over_a_draft_file_unbinds_the_replaced_id() {
    let server = MockServer::start().await;
    mount_info(&server).await;
    mount_latest(&server, version("DRAFT", vec![key_entry(7)])).await;
    Mock::given(method("POST"))
        .and(path("/api/files/7/replace"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(ok_body(json!({"files": [key_entry(8)]}))),
        )
        .mount(&server)
        .await;
    mount_versions(&server, vec![version("DRAFT", vec![key_entry(8)])]).await;

    let store_file = temp_content(b"second draft");
    let input = format!(
        "{prepare}\
         TRANSFER STORE {KEY} {store}\n\
         VALUE {DIRHASH}\n\
         VALUE 7\n\
         VALUE\n",
        prepare = prepare_lines(&server.uri()),
        store = store_file.path().display(),
    );

    let (result, output) = run_remote(input).await;
    result.unwrap();

    // Id 7 was never released: its binding is dropped before 8 is added.
    assert_lines_in_order(
        &output,
        &[
            format!("SETSTATE {KEY} "),
            format!("SETSTATE {KEY} 8"),
            format!("TRANSFER-SUCCESS STORE {KEY}"),
        ],
    );
    assert!(!output.contains(&format!("SETSTATE {KEY} 7,8")));
}

#[tokio::test]
async fn duplicate_content_store_succeeds_without_touching_bindings() {
    let server = MockServer::start().await;
    mount_info(&server).await;
    mount_latest(&server, version("DRAFT", vec![])).await;
    Mock::given(method("POST"))
        .and(path("/api/datasets/:persistentId/add"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "status": "ERROR",
            "message": "Error! You may not upload a file with duplicate content."
        })))
        .mount(&server)
        .await;

    let store_file = temp_content(b"same bytes");
    let input = format!(
        "{prepare}\
         TRANSFER STORE {KEY} {store}\n\
         VALUE {DIRHASH}\n",
        prepare = prepare_lines(&server.uri()),
        store = store_file.path().display(),
    );

    let (result, output) = run_remote(input).await;
    result.unwrap();

    assert_lines_in_order(&output, &[&format!("TRANSFER-SUCCESS STORE {KEY}")]);
    assert!(
        !output.contains("SETSTATE"),
        "duplicate content must leave bindings untouched:\n{output}"
    );
    assert!(output.contains("duplicate content"));
}

#[tokio::test]
async fn checkpresent_binds_ids_found_by_path_matching() {
    let server = MockServer::start().await;
    mount_info(&server).await;
    mount_latest(&server, version("DRAFT", vec![key_entry(42)])).await;

    // No id on record: the fallback path match finds the file and records
    // the id to speed up future calls.
    let input = format!(
        "{prepare}\
         CHECKPRESENT {KEY}\n\
         VALUE\n\
         VALUE {DIRHASH}\n\
         VALUE\n",
        prepare = prepare_lines(&server.uri()),
    );

    let (result, output) = run_remote(input).await;
    result.unwrap();
    assert_lines_in_order(
        &output,
        &[
            format!("SETSTATE {KEY} 42"),
            format!("CHECKPRESENT-SUCCESS {KEY}"),
        ],
    );
}

#[tokio::test]
async fn checkpresent_with_a_stale_binding_reports_absent() {
    let server = MockServer::start().await;
    mount_info(&server).await;
    mount_latest(&server, version("DRAFT", vec![])).await;
    mount_versions(&server, vec![version("DRAFT", vec![])]).await;

    // The bound id is gone from every version.
    let input = format!(
        "{prepare}\
         CHECKPRESENT {KEY}\n\
         VALUE 999\n",
        prepare = prepare_lines(&server.uri()),
    );

    let (result, output) = run_remote(input).await;
    result.unwrap();
    assert_lines_in_order(&output, &[format!("CHECKPRESENT-FAILURE {KEY}")]);
}

#[tokio::test]
async fn retrieve_of_unknown_content_is_a_per_verb_failure() {
    let server = MockServer::start().await;
    mount_info(&server).await;
    mount_latest(&server, version("DRAFT", vec![])).await;
    mount_versions(&server, vec![version("DRAFT", vec![])]).await;

    let out_dir = tempfile::tempdir().unwrap();
    let input = format!(
        "{prepare}\
         TRANSFER RETRIEVE {KEY} {out}\n\
         VALUE\n\
         VALUE {DIRHASH}\n",
        prepare = prepare_lines(&server.uri()),
        out = out_dir.path().join("never-written").display(),
    );

    let (result, output) = run_remote(input).await;
    result.unwrap();
    assert!(
        output.contains(&format!("TRANSFER-FAILURE RETRIEVE {KEY}")),
        "{output}"
    );
}

#[tokio::test]
async fn transport_errors_fail_the_verb_but_not_the_process() {
    let server = MockServer::start().await;
    mount_info(&server).await;
    mount_latest(&server, version("DRAFT", vec![])).await;
    mount_versions(&server, vec![version("DRAFT", vec![])]).await;
    Mock::given(method("POST"))
        .and(path("/api/datasets/:persistentId/add"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .mount(&server)
        .await;

    let store_file = temp_content(b"payload");
    let input = format!(
        "{prepare}\
         TRANSFER STORE {KEY} {store}\n\
         VALUE {DIRHASH}\n\
         CHECKPRESENT {KEY}\n\
         VALUE\n\
         VALUE {DIRHASH}\n",
        prepare = prepare_lines(&server.uri()),
        store = store_file.path().display(),
    );

    let (result, output) = run_remote(input).await;
    // The failed store is answered and the loop keeps serving.
    result.unwrap();
    assert_lines_in_order(
        &output,
        &[
            format!("TRANSFER-FAILURE STORE {KEY}"),
            format!("CHECKPRESENT-FAILURE {KEY}"),
        ],
    );
    assert!(!output.contains("SETSTATE"), "{output}");
}

// ---------------------------------------------------------------------------
// Export mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn export_store_rename_and_checkpresent() {
    let server = MockServer::start().await;
    mount_info(&server).await;
    mount_latest(&server, version("DRAFT", vec![])).await;
    Mock::given(method("POST"))
        .and(path("/api/datasets/:persistentId/add"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(
            json!({"files": [file_entry(201, Some("a"), "b.txt")]}),
        )))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/files/201/metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"File Metadata update has been completed: {"label":"c.txt","directoryLabel":"a"}"#,
        ))
        .mount(&server)
        .await;

    let store_file = temp_content(b"exported");
    let input = format!(
        "{prepare}\
         EXPORTSUPPORTED\n\
         EXPORT a/b.txt\n\
         TRANSFEREXPORT STORE {KEY} {store}\n\
         VALUE\n\
         EXPORT a/b.txt\n\
         RENAMEEXPORT {KEY} a/c.txt\n\
         EXPORT a/c.txt\n\
         CHECKPRESENTEXPORT {KEY}\n\
         VALUE 201\n\
         EXPORT a/b.txt\n\
         CHECKPRESENTEXPORT {KEY}\n\
         VALUE 201\n",
        prepare = prepare_lines(&server.uri()),
        store = store_file.path().display(),
    );

    let (result, output) = run_remote(input).await;
    result.unwrap();

    assert_lines_in_order(
        &output,
        &[
            "EXPORTSUPPORTED-SUCCESS".to_string(),
            format!("SETSTATE {KEY} 201"),
            format!("TRANSFER-SUCCESS STORE {KEY}"),
            format!("RENAMEEXPORT-SUCCESS {KEY}"),
            format!("CHECKPRESENT-SUCCESS {KEY}"),
            format!("CHECKPRESENT-FAILURE {KEY}"),
        ],
    );
}

#[tokio::test]
async fn rename_of_an_unknown_export_path_is_unsupported() {
    let server = MockServer::start().await;
    mount_info(&server).await;
    mount_latest(&server, version("DRAFT", vec![])).await;

    let input = format!(
        "{prepare}\
         EXPORT missing.txt\n\
         RENAMEEXPORT {KEY} elsewhere.txt\n",
        prepare = prepare_lines(&server.uri()),
    );

    let (result, output) = run_remote(input).await;
    result.unwrap();
    assert_lines_in_order(&output, &["UNSUPPORTED-REQUEST"]);
    assert!(!output.contains("RENAMEEXPORT-SUCCESS"));
}

#[tokio::test]
async fn remove_export_deletes_and_unbinds_draft_content() {
    let server = MockServer::start().await;
    mount_info(&server).await;
    mount_latest(&server, version("DRAFT", vec![file_entry(201, Some("a"), "b.txt")])).await;
    Mock::given(method("DELETE"))
        .and(path("/dvn/api/data-deposit/v1.1/swordv2/edit-media/file/201"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    mount_versions(&server, vec![version("DRAFT", vec![])]).await;

    let input = format!(
        "{prepare}\
         EXPORT a/b.txt\n\
         REMOVEEXPORT {KEY}\n\
         VALUE 201\n",
        prepare = prepare_lines(&server.uri()),
    );

    let (result, output) = run_remote(input).await;
    result.unwrap();
    assert_lines_in_order(
        &output,
        &[format!("SETSTATE {KEY} "), format!("REMOVE-SUCCESS {KEY}")],
    );
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_doi_fails_initremote_and_terminates() {
    let input = "INITREMOTE\nVALUE http://localhost:1\nVALUE\n".to_string();
    let (result, output) = run_remote(input).await;
    assert!(result.is_err());
    assert!(
        output.contains("INITREMOTE-FAILURE invalid configuration: doi must be specified"),
        "{output}"
    );
}

#[tokio::test]
async fn unknown_verbs_get_unsupported_request() {
    let (result, output) = run_remote("WHEREIS some-key\n".to_string()).await;
    result.unwrap();
    assert_lines_in_order(&output, &["VERSION 1", "UNSUPPORTED-REQUEST"]);
}
