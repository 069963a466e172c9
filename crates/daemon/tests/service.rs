//! End-to-end scenarios over an in-process daemon: the control channel
//! manages tickets while the data plane moves bytes.

mod support;

use support::{ticket_json, TestDaemon};
use uuid::Uuid;

#[test]
fn add_get_delete_ticket() {
    let daemon = TestDaemon::start();
    let mut control = daemon.control_client();
    let ticket = Uuid::new_v4().to_string();

    let response = control.request(
        "PUT",
        &format!("/tickets/{ticket}"),
        &[],
        ticket_json(&ticket, 1_048_576, "memory:", &["read", "write"], 300).as_bytes(),
    );
    assert_eq!(response.status, 200);

    let response = control.request("GET", &format!("/tickets/{ticket}"), &[], b"");
    assert_eq!(response.status, 200);
    let info = response.json();
    assert_eq!(info["size"], 1_048_576);
    assert_eq!(info["transferred"], 0);
    assert_eq!(info["active"], 0);
    assert_eq!(info["timeout"], 300);

    let response = control.request("DELETE", &format!("/tickets/{ticket}"), &[], b"");
    assert_eq!(response.status, 204);

    let response = control.request("GET", &format!("/tickets/{ticket}"), &[], b"");
    assert_eq!(response.status, 404);
    assert_eq!(response.json()["code"], 404);
}

#[test]
fn write_then_read_accounts_merged_ranges() {
    let daemon = TestDaemon::start();
    let mut control = daemon.control_client();
    let ticket = Uuid::new_v4().to_string();

    let response = control.request(
        "PUT",
        &format!("/tickets/{ticket}"),
        &[],
        ticket_json(&ticket, 1_048_576, "memory:", &["read", "write"], 300).as_bytes(),
    );
    assert_eq!(response.status, 200);

    // The memory backend lives on the connection; write and read over the
    // same Keep-Alive connection.
    let mut client = daemon.data_client();
    let response = client.request(
        "PUT",
        &format!("/images/{ticket}"),
        &[("Content-Range", "bytes 0-11/*")],
        b"hello, world",
    );
    assert_eq!(response.status, 200);

    let response = client.request(
        "GET",
        &format!("/images/{ticket}"),
        &[("Range", "bytes=0-11")],
        b"",
    );
    assert_eq!(response.status, 206);
    assert_eq!(response.body, b"hello, world");
    assert_eq!(response.header("content-range"), Some("bytes 0-11/1048576"));

    // Re-reading the same bytes must not inflate the counter.
    let response = client.request(
        "GET",
        &format!("/images/{ticket}"),
        &[("Range", "bytes=0-11")],
        b"",
    );
    assert_eq!(response.status, 206);

    let response = control.request("GET", &format!("/tickets/{ticket}"), &[], b"");
    assert_eq!(response.json()["transferred"], 12);
}

#[test]
fn read_without_range_pads_to_ticket_size() {
    let daemon = TestDaemon::start();
    let mut control = daemon.control_client();
    let ticket = Uuid::new_v4().to_string();
    control.request(
        "PUT",
        &format!("/tickets/{ticket}"),
        &[],
        ticket_json(&ticket, 65_536, "memory:", &["read", "write"], 300).as_bytes(),
    );

    let mut client = daemon.data_client();
    let response = client.request(
        "PUT",
        &format!("/images/{ticket}"),
        &[("Content-Range", "bytes 0-3/*")],
        b"data",
    );
    assert_eq!(response.status, 200);

    let response = client.request("GET", &format!("/images/{ticket}"), &[], b"");
    assert_eq!(response.status, 200);
    assert_eq!(response.body.len(), 65_536);
    assert_eq!(&response.body[..4], b"data");
    assert!(response.body[4..].iter().all(|&b| b == 0));
}

#[test]
fn write_outside_ticket_size_is_refused() {
    let daemon = TestDaemon::start();
    let mut control = daemon.control_client();
    let ticket = Uuid::new_v4().to_string();
    control.request(
        "PUT",
        &format!("/tickets/{ticket}"),
        &[],
        ticket_json(&ticket, 1_048_576, "memory:", &["read", "write"], 300).as_bytes(),
    );

    let mut client = daemon.data_client();
    let response = client.request(
        "PUT",
        &format!("/images/{ticket}"),
        &[("Content-Range", "bytes 1048576-1048579/*")],
        b"abcd",
    );
    assert_eq!(response.status, 416);
    let error = response.json();
    assert_eq!(error["code"], 416);
    assert_eq!(error["detail"], "ticket size = 1048576");
}

#[test]
fn expired_ticket_is_gone() {
    let daemon = TestDaemon::start();
    let mut control = daemon.control_client();
    let ticket = Uuid::new_v4().to_string();
    control.request(
        "PUT",
        &format!("/tickets/{ticket}"),
        &[],
        ticket_json(&ticket, 1_048_576, "memory:", &["read"], 1).as_bytes(),
    );

    std::thread::sleep(std::time::Duration::from_secs(2));

    let mut client = daemon.data_client();
    let response = client.request("GET", &format!("/images/{ticket}"), &[], b"");
    assert_eq!(response.status, 410);
}

#[test]
fn unknown_and_forbidden_tickets() {
    let daemon = TestDaemon::start();
    let mut control = daemon.control_client();
    let mut client = daemon.data_client();

    // Unknown ticket.
    let response = client.request(
        "GET",
        &format!("/images/{}", Uuid::new_v4()),
        &[],
        b"",
    );
    assert_eq!(response.status, 401);

    // Read-only ticket refuses writes.
    let ticket = Uuid::new_v4().to_string();
    control.request(
        "PUT",
        &format!("/tickets/{ticket}"),
        &[],
        ticket_json(&ticket, 1024, "memory:", &["read"], 300).as_bytes(),
    );
    let response = client.request(
        "PUT",
        &format!("/images/{ticket}"),
        &[("Content-Range", "bytes 0-3/*")],
        b"abcd",
    );
    assert_eq!(response.status, 403);
}

#[test]
fn patch_zero_and_flush_ops() {
    let daemon = TestDaemon::start();
    let mut control = daemon.control_client();
    let ticket = Uuid::new_v4().to_string();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.raw");
    let file = std::fs::File::create(&path).unwrap();
    file.set_len(65_536).unwrap();

    control.request(
        "PUT",
        &format!("/tickets/{ticket}"),
        &[],
        ticket_json(
            &ticket,
            65_536,
            &format!("file:{}", path.display()),
            &["read", "write"],
            300,
        )
        .as_bytes(),
    );

    let mut client = daemon.data_client();
    let response = client.request(
        "PUT",
        &format!("/images/{ticket}"),
        &[("Content-Range", "bytes 0-4095/*")],
        &[0xABu8; 4096],
    );
    assert_eq!(response.status, 200);

    let response = client.request(
        "PATCH",
        &format!("/images/{ticket}"),
        &[("Content-Type", "application/json")],
        br#"{"op": "zero", "size": 65536, "offset": 0, "flush": true}"#,
    );
    assert_eq!(response.status, 200);

    // The image size is unchanged and the contents read back as zeroes.
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 65_536);
    let response = client.request(
        "GET",
        &format!("/images/{ticket}"),
        &[("Range", "bytes=0-65535")],
        b"",
    );
    assert_eq!(response.status, 206);
    assert_eq!(response.body.len(), 65_536);
    assert!(response.body.iter().all(|&b| b == 0));

    let response = client.request(
        "PATCH",
        &format!("/images/{ticket}"),
        &[("Content-Type", "application/json")],
        br#"{"op": "flush"}"#,
    );
    assert_eq!(response.status, 200);

    let response = client.request(
        "PATCH",
        &format!("/images/{ticket}"),
        &[("Content-Type", "application/json")],
        br#"{"op": "melt"}"#,
    );
    assert_eq!(response.status, 400);
}

#[test]
fn checksum_endpoint_matches_local_hash() {
    let daemon = TestDaemon::start();
    let mut control = daemon.control_client();
    let ticket = Uuid::new_v4().to_string();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.raw");
    let contents = vec![0x5Au8; 70_000];
    std::fs::write(&path, &contents).unwrap();

    control.request(
        "PUT",
        &format!("/tickets/{ticket}"),
        &[],
        ticket_json(
            &ticket,
            70_000,
            &format!("file:{}", path.display()),
            &["read"],
            300,
        )
        .as_bytes(),
    );

    let mut client = daemon.data_client();
    let response = client.request("GET", &format!("/images/{ticket}/checksum"), &[], b"");
    assert_eq!(response.status, 200);
    let reply = response.json();

    let mut expected = checksums::Blkhash::default_hasher();
    expected.update(&contents);
    assert_eq!(reply["checksum"], expected.finalize_hex());
    assert_eq!(reply["algorithm"], "blake2b");
}

#[test]
fn info_reports_version() {
    let daemon = TestDaemon::start();
    let mut client = daemon.data_client();
    let response = client.request("GET", "/info/", &[], b"");
    assert_eq!(response.status, 200);
    assert!(response.json()["version"].is_string());
}

#[test]
fn options_preflight_returns_cors_headers() {
    let daemon = TestDaemon::start();
    let mut client = daemon.data_client();
    let response = client.request(
        "OPTIONS",
        &format!("/images/{}", Uuid::new_v4()),
        &[
            ("Origin", "https://engine.example"),
            ("Access-Control-Request-Method", "PUT"),
            ("Access-Control-Request-Headers", "content-range"),
        ],
        b"",
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.header("access-control-allow-origin"), Some("*"));
    assert_eq!(
        response.header("access-control-allow-methods"),
        Some("OPTIONS,GET,PUT,PATCH")
    );
    assert_eq!(response.header("access-control-max-age"), Some("86400"));
    assert!(response
        .header("allow")
        .is_some_and(|allow| allow.contains("PATCH")));
}

#[test]
fn profile_toggle_is_stateful() {
    let daemon = TestDaemon::start();
    let mut control = daemon.control_client();

    let response = control.request("POST", "/profile/?run=y", &[], b"");
    assert_eq!(response.status, 200);
    let response = control.request("POST", "/profile/?run=y", &[], b"");
    assert_eq!(response.status, 400);

    let response = control.request("GET", "/profile/", &[], b"");
    assert_eq!(response.json()["running"], true);

    let response = control.request("POST", "/profile/?run=n", &[], b"");
    assert_eq!(response.status, 200);
    let response = control.request("POST", "/profile/?run=n", &[], b"");
    assert_eq!(response.status, 400);
}

#[test]
fn unknown_routes_and_methods() {
    let daemon = TestDaemon::start();
    let mut client = daemon.data_client();

    let response = client.request("GET", "/nosuch", &[], b"");
    assert_eq!(response.status, 404);

    let response = client.request("DELETE", &format!("/images/{}", Uuid::new_v4()), &[], b"");
    assert_eq!(response.status, 405);

    let response = client.request("PUT", "/info/", &[], b"");
    assert_eq!(response.status, 405);
}

#[test]
fn chunked_upload_is_accepted() {
    let daemon = TestDaemon::start();
    let mut control = daemon.control_client();
    let ticket = Uuid::new_v4().to_string();
    control.request(
        "PUT",
        &format!("/tickets/{ticket}"),
        &[],
        ticket_json(&ticket, 1024, "memory:", &["read", "write"], 300).as_bytes(),
    );

    // Hand-rolled chunked request: the test client always sends
    // Content-Length, so write this one directly.
    let mut client = daemon.data_client();
    let raw = format!(
        "PUT /images/{ticket} HTTP/1.1\r\nHost: localhost\r\n\
         Transfer-Encoding: chunked\r\n\r\n\
         5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n"
    );
    let response = client.raw_request(raw.as_bytes());
    assert_eq!(response.status, 200);

    let response = client.request(
        "GET",
        &format!("/images/{ticket}"),
        &[("Range", "bytes=0-11")],
        b"",
    );
    assert_eq!(response.body, b"hello, world");
}
