use std::io::{Read, Write};
use std::net::TcpListener;

use assert_cmd::Command;

const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

fn mdown() -> Command {
    let mut cmd = Command::cargo_bin("mdown").unwrap();
    // the fixtures listen on loopback
    for var in ["http_proxy", "HTTP_PROXY", "all_proxy", "ALL_PROXY", "RUST_LOG"] {
        cmd.env_remove(var);
    }
    cmd
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Serves `body` with `status` to every connection.
fn serve(status: &'static str, body: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            let header = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(header.as_bytes());
            let _ = stream.write_all(body);
        }
    });
    format!("http://{addr}")
}

#[test]
fn help_lists_options() {
    let assert = mdown().arg("--help").assert().success();
    let stdout = text(&assert.get_output().stdout);
    assert!(stdout.contains("--max-concurrent"));
    assert!(stdout.contains("--sha256"));
}

#[test]
fn requires_a_link() {
    mdown().assert().failure();
}

#[test]
fn rejects_unsupported_scheme() {
    let assert = mdown().arg("ftp://example.com/file").assert().failure();
    assert!(text(&assert.get_output().stderr).contains("unsupported"));
}

#[test]
fn sha256_with_several_links_is_rejected() {
    let assert = mdown()
        .args([
            "https://a.example/x",
            "https://b.example/y",
            "--sha256",
            HELLO_SHA256,
        ])
        .assert()
        .failure();
    assert!(text(&assert.get_output().stderr).contains("single link"));
}

#[test]
fn downloads_ed2k_link_into_output_dir() {
    let dir = tempfile::tempdir().unwrap();
    let assert = mdown()
        .args([
            "ed2k://|file|sample.bin|4096|0123456789abcdef0123456789abcdef|/",
            "-o",
        ])
        .arg(dir.path())
        .arg("--tick-ms")
        .arg("50")
        .assert()
        .success();
    assert!(text(&assert.get_output().stdout).contains("finished"));

    let written = std::fs::metadata(dir.path().join("sample.bin")).unwrap();
    assert_eq!(written.len(), 4096);
}

#[test]
fn downloads_several_links_with_one_slot() {
    let dir = tempfile::tempdir().unwrap();
    mdown()
        .args([
            "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a&dn=one.iso",
            "ed2k://|file|two.bin|1000|0123456789abcdef0123456789abcdef|/",
            "--peer-size",
            "2KiB",
            "-j",
            "1",
            "-q",
            "-o",
        ])
        .arg(dir.path())
        .assert()
        .success();

    assert_eq!(
        std::fs::metadata(dir.path().join("one.iso")).unwrap().len(),
        2048
    );
    assert_eq!(
        std::fs::metadata(dir.path().join("two.bin")).unwrap().len(),
        1000
    );
}

#[test]
fn downloads_http_link_and_verifies_checksum() {
    let base = serve("200 OK", b"hello world");
    let dir = tempfile::tempdir().unwrap();
    mdown()
        .arg(format!("{base}/hello.txt"))
        .args(["--sha256", HELLO_SHA256, "-q", "-o"])
        .arg(dir.path())
        .assert()
        .success();

    assert_eq!(
        std::fs::read(dir.path().join("hello.txt")).unwrap(),
        b"hello world"
    );
}

#[test]
fn failed_download_sets_exit_status() {
    let base = serve("404 Not Found", b"missing");
    let dir = tempfile::tempdir().unwrap();
    let assert = mdown()
        .arg(format!("{base}/missing.bin"))
        .arg("-o")
        .arg(dir.path())
        .assert()
        .failure();
    let output = assert.get_output();
    assert!(text(&output.stdout).contains("failed"));
    assert!(text(&output.stderr).contains("did not finish"));
}

#[test]
fn json_mode_prints_a_summary() {
    let dir = tempfile::tempdir().unwrap();
    let assert = mdown()
        .args([
            "ed2k://|file|data.bin|512|0123456789abcdef0123456789abcdef|/",
            "--json",
            "--tick-ms",
            "50",
            "-o",
        ])
        .arg(dir.path())
        .assert()
        .success();
    let stdout = text(&assert.get_output().stdout);
    assert!(stdout.contains("\"event\":\"summary\""));
    assert!(stdout.contains("\"state\":\"finished\""));
    assert!(stdout.lines().all(|line| line.starts_with('{')));
}

#[test]
fn verbose_logs_go_to_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let assert = mdown()
        .args([
            "ed2k://|file|log.bin|256|0123456789abcdef0123456789abcdef|/",
            "-v",
            "--json",
            "-o",
        ])
        .arg(dir.path())
        .assert()
        .success();
    let output = assert.get_output();
    assert!(text(&output.stderr).contains("DEBUG"));
    assert!(!text(&output.stdout).contains("DEBUG"));
}
