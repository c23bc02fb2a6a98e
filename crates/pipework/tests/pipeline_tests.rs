//! End-to-end pipeline tests driving real child programs.
//!
//! These exercise every endpoint kind (inherited, descriptor, file, byte
//! buffer, source/sink objects) and the in-process filter seam against
//! small, universally available programs (cat, echo, sort, md5sum,
//! sha256sum, sh).

use std::fs::File;
use std::sync::{Mutex, MutexGuard, OnceLock};

use pipework::{Filter, PipeWriter, Pipeline, PipelineError, Sink, Source};
use sha2::{Digest, Sha256};

/// Child reaping uses wait(2), which reaps any child of this process; hold
/// a process-wide lock around each run so concurrently running tests cannot
/// steal each other's children.
fn reap_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// In-process participants used across the tests
// ============================================================================

/// Writes the low octet of an incrementing counter, 1000 bytes per poll,
/// 100 KiB in total, and keeps a copy of everything it wrote.
struct CountingSource {
    remaining: usize,
    wrote: Vec<u8>,
}

impl CountingSource {
    fn new() -> Self {
        Self {
            remaining: 100 * 1024,
            wrote: Vec::new(),
        }
    }
}

impl Source for CountingSource {
    fn poll(&mut self, out: &mut PipeWriter<'_>) -> bool {
        for i in 0..1000usize {
            if self.remaining == 0 {
                break;
            }
            let byte = [i as u8];
            out.write(&byte);
            self.wrote.extend_from_slice(&byte);
            self.remaining -= 1;
        }
        self.remaining > 0
    }
}

/// Forwards every byte verbatim while folding it into a SHA-256 digest.
struct DigestFilter {
    hasher: Sha256,
    digest: Option<String>,
}

impl DigestFilter {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            digest: None,
        }
    }
}

impl Filter for DigestFilter {
    fn process(&mut self, data: &[u8], out: &mut PipeWriter<'_>) {
        self.hasher.update(data);
        out.write(data);
    }

    fn eof(&mut self, _out: &mut PipeWriter<'_>) {
        let digest = std::mem::take(&mut self.hasher).finalize();
        self.digest = Some(format!("{:x}", digest));
    }
}

/// Forwards bytes unchanged, counting chunks and eof calls.
struct PassthroughFilter {
    seen: usize,
    eof_calls: usize,
}

impl PassthroughFilter {
    fn new() -> Self {
        Self { seen: 0, eof_calls: 0 }
    }
}

impl Filter for PassthroughFilter {
    fn process(&mut self, data: &[u8], out: &mut PipeWriter<'_>) {
        self.seen += data.len();
        out.write(data);
    }

    fn eof(&mut self, _out: &mut PipeWriter<'_>) {
        self.eof_calls += 1;
    }
}

/// Accumulates output and records how much had arrived when eof fired.
struct CollectSink {
    data: Vec<u8>,
    eof_calls: usize,
    len_at_eof: Option<usize>,
}

impl CollectSink {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            eof_calls: 0,
            len_at_eof: None,
        }
    }
}

impl Sink for CollectSink {
    fn process(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    fn eof(&mut self) {
        self.eof_calls += 1;
        self.len_at_eof = Some(self.data.len());
    }
}

const SHA256_OF_COUNTER_STREAM: &str =
    "56ecf4a9d98115c3b2b47a5c0af9a1562c674e086bc05c095acbaaf4531359e5";

const MD5_OF_TEST123: &str = "cc03e747a6afbbcbf8be7668acfebee5";

// ============================================================================
// Endpoint round-trips
// ============================================================================

#[test]
fn echo_to_byte_buffer() {
    let _guard = reap_lock();
    let mut out = Vec::new();

    let mut ep = Pipeline::new();
    ep.set_output_bytes(&mut out);
    ep.add_exec("/bin/echo", &["test123"]);
    ep.run().expect("pipeline run failed");
    assert!(ep.all_return_codes_zero());

    drop(ep);
    assert_eq!(out, b"test123\n");
}

#[test]
fn large_byte_buffer_through_cat() {
    let _guard = reap_lock();
    let mut input = b"test123".to_vec();
    input.extend(std::iter::repeat(1u8).take(1024 * 1024));
    let mut out = Vec::new();

    let mut ep = Pipeline::new();
    ep.set_input_bytes(&input);
    ep.set_output_bytes(&mut out);
    ep.add_exec("/bin/cat", &[]);
    ep.run().expect("pipeline run failed");
    assert!(ep.all_return_codes_zero());

    drop(ep);
    assert_eq!(out, input);
}

#[test]
fn cat_then_md5sum() {
    let _guard = reap_lock();
    let input = b"test123".to_vec();
    let mut out = Vec::new();

    let mut ep = Pipeline::new();
    ep.set_input_bytes(&input);
    ep.set_output_bytes(&mut out);
    ep.add_exec("/bin/cat", &[]);
    ep.add_execp("md5sum", &[]);
    ep.run().expect("pipeline run failed");
    assert!(ep.all_return_codes_zero());

    drop(ep);
    assert!(
        out.starts_with(MD5_OF_TEST123.as_bytes()),
        "unexpected md5sum output: {}",
        String::from_utf8_lossy(&out)
    );
}

#[test]
fn file_through_sort() {
    let _guard = reap_lock();
    let mut out = Vec::new();

    let mut ep = Pipeline::new();
    ep.set_input_file("/etc/passwd");
    ep.set_output_bytes(&mut out);
    ep.add_execp("sort", &[]);
    ep.run().expect("pipeline run failed");
    assert!(ep.all_return_codes_zero());

    drop(ep);
    assert!(!out.is_empty(), "sort of /etc/passwd produced no output");
}

#[test]
fn input_fd_through_cat() {
    let _guard = reap_lock();
    let expected = std::fs::read("/etc/passwd").expect("read /etc/passwd");
    let file = File::open("/etc/passwd").expect("open /etc/passwd");
    let mut out = Vec::new();

    let mut ep = Pipeline::new();
    ep.set_input_fd(file.into());
    ep.set_output_bytes(&mut out);
    ep.add_exec("/bin/cat", &[]);
    ep.run().expect("pipeline run failed");
    assert!(ep.all_return_codes_zero());

    drop(ep);
    assert_eq!(out, expected);
}

#[test]
fn output_fd_receives_echo() {
    let _guard = reap_lock();
    let path = std::env::temp_dir().join(format!("pipework-outfd-{}", std::process::id()));
    let file = File::create(&path).expect("create temp output file");

    let mut ep = Pipeline::new();
    ep.set_output_fd(file.into());
    ep.add_exec("/bin/echo", &["fd-endpoint"]);
    ep.run().expect("pipeline run failed");
    assert!(ep.all_return_codes_zero());

    let written = std::fs::read_to_string(&path).expect("read temp output file");
    std::fs::remove_file(&path).ok();
    assert_eq!(written, "fd-endpoint\n");
}

#[test]
fn output_file_is_created_and_truncated() {
    let _guard = reap_lock();
    let path = std::env::temp_dir().join(format!("pipework-outfile-{}", std::process::id()));
    std::fs::write(&path, "stale contents that must disappear").expect("seed output file");

    let mut ep = Pipeline::new();
    ep.set_output_file(&path);
    ep.add_exec("/bin/echo", &["file-endpoint"]);
    ep.run().expect("pipeline run failed");
    assert!(ep.all_return_codes_zero());
    drop(ep);

    let written = std::fs::read_to_string(&path).expect("read output file");
    std::fs::remove_file(&path).ok();
    assert_eq!(written, "file-endpoint\n");
}

// ============================================================================
// Source and sink objects
// ============================================================================

#[test]
fn sink_receives_md5_digest() {
    let _guard = reap_lock();
    let input = b"test123".to_vec();
    let mut sink = CollectSink::new();

    let mut ep = Pipeline::new();
    ep.set_input_bytes(&input);
    ep.set_output_sink(&mut sink);
    ep.add_execp("md5sum", &[]);
    ep.run().expect("pipeline run failed");
    assert!(ep.all_return_codes_zero());

    drop(ep);
    assert_eq!(sink.eof_calls, 1);
    assert_eq!(sink.len_at_eof, Some(sink.data.len()));
    assert!(sink.data.starts_with(MD5_OF_TEST123.as_bytes()));
}

#[test]
fn source_through_cat() {
    let _guard = reap_lock();
    let mut source = CountingSource::new();
    let mut out = Vec::new();

    let mut ep = Pipeline::new();
    ep.set_input_source(&mut source);
    ep.set_output_bytes(&mut out);
    ep.add_execp("cat", &[]);
    ep.run().expect("pipeline run failed");
    assert!(ep.all_return_codes_zero());

    drop(ep);
    assert_eq!(source.wrote.len(), 100 * 1024);
    assert_eq!(out, source.wrote);
}

#[test]
fn source_cat_digest_filter_sha256sum() {
    let _guard = reap_lock();
    let mut source = CountingSource::new();
    let mut filter = DigestFilter::new();
    let mut out = Vec::new();

    let mut ep = Pipeline::new();
    ep.set_input_source(&mut source);
    ep.set_output_bytes(&mut out);
    ep.add_execp("cat", &[]);
    ep.add_filter(&mut filter);
    ep.add_execp("sha256sum", &[]);
    ep.run().expect("pipeline run failed");
    assert!(ep.all_return_codes_zero());

    drop(ep);
    assert_eq!(filter.digest.as_deref(), Some(SHA256_OF_COUNTER_STREAM));
    assert!(
        out.starts_with(SHA256_OF_COUNTER_STREAM.as_bytes()),
        "sha256sum disagrees with the in-process digest: {}",
        String::from_utf8_lossy(&out)
    );
}

#[test]
fn source_cat_digest_filter_to_bytes() {
    let _guard = reap_lock();
    let mut source = CountingSource::new();
    let mut filter = DigestFilter::new();
    let mut out = Vec::new();

    let mut ep = Pipeline::new();
    ep.set_input_source(&mut source);
    ep.set_output_bytes(&mut out);
    ep.add_execp("cat", &[]);
    ep.add_filter(&mut filter);
    ep.run().expect("pipeline run failed");
    assert!(ep.all_return_codes_zero());

    drop(ep);
    assert_eq!(filter.digest.as_deref(), Some(SHA256_OF_COUNTER_STREAM));
    assert_eq!(out.len(), 100 * 1024);
}

#[test]
fn passthrough_filter_is_transparent() {
    let _guard = reap_lock();
    let input: Vec<u8> = (0..20_000u32).flat_map(|i| i.to_le_bytes()).collect();
    let mut filter = PassthroughFilter::new();
    let mut out = Vec::new();

    let mut ep = Pipeline::new();
    ep.set_input_bytes(&input);
    ep.set_output_bytes(&mut out);
    ep.add_exec("/bin/cat", &[]);
    ep.add_filter(&mut filter);
    ep.add_exec("/bin/cat", &[]);
    ep.run().expect("pipeline run failed");
    assert!(ep.all_return_codes_zero());

    drop(ep);
    assert_eq!(out, input);
    assert_eq!(filter.seen, input.len());
    assert_eq!(filter.eof_calls, 1);
}

// ============================================================================
// Exec variants and exit statuses
// ============================================================================

#[test]
fn exece_env_reaches_child() {
    let _guard = reap_lock();
    let mut out = Vec::new();

    let mut ep = Pipeline::new();
    ep.set_output_bytes(&mut out);
    ep.add_exece(
        "/bin/sh",
        vec!["/bin/sh".into(), "-c".into(), "set".into()],
        Some(vec!["TEST=123".into()]),
    );
    ep.run().expect("pipeline run failed");
    assert!(ep.all_return_codes_zero());

    drop(ep);
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("TEST=123"), "environment not visible: {}", text);
}

#[test]
fn nonexistent_program_exits_255() {
    let _guard = reap_lock();
    let mut ep = Pipeline::new();
    ep.add_exec("xyz-non-existing-program", &[]);
    ep.run().expect("pipeline run failed");

    assert!(!ep.all_return_codes_zero());
    assert_eq!(ep.return_code(0), 255);
    assert_eq!(ep.return_signal(0), -1);
}

#[test]
fn signal_termination_is_reported() {
    let _guard = reap_lock();
    let mut ep = Pipeline::new();
    ep.add_exec("/bin/sh", &["-c", "kill -TERM $$"]);
    ep.run().expect("pipeline run failed");

    assert!(!ep.all_return_codes_zero());
    assert_eq!(ep.return_code(0), -1);
    assert_eq!(ep.return_signal(0), 15);
}

// ============================================================================
// Configuration errors and endpoint exclusivity
// ============================================================================

#[test]
fn empty_pipeline_is_an_error() {
    let mut ep = Pipeline::new();
    assert!(matches!(ep.run(), Err(PipelineError::NoStages)));
}

#[test]
fn first_input_endpoint_wins() {
    let _guard = reap_lock();
    let first = b"first\n".to_vec();
    let second = b"second\n".to_vec();
    let mut out = Vec::new();

    let mut ep = Pipeline::new();
    ep.set_input_bytes(&first);
    ep.set_input_bytes(&second);
    ep.set_output_bytes(&mut out);
    ep.add_exec("/bin/cat", &[]);
    ep.run().expect("pipeline run failed");
    assert!(ep.all_return_codes_zero());

    drop(ep);
    assert_eq!(out, first);
}
