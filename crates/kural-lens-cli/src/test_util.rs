use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use kural_lens_lib::context::RealKuralContext;
use kural_lens_lib::corpus::Pal;
use kural_lens_lib::runtime::Runtime;
use kural_lens_lib::test_util::{
    FakeProvider, QUERY_RGB, TEST_CONFIG, query_for, solid_image, vectors_with_scores,
    write_corpus, write_index, write_projection,
};

/// A [`Runtime`] over `root/artifacts` and `root/models` with a fake extractor.
///
/// Nothing is written; the artifact directory may not exist.
pub fn runtime_in(root: &Path) -> Runtime {
    let ctx = RealKuralContext::new(root.join("artifacts"), root.join("models"));
    Runtime::with_provider(ctx, FakeProvider::new(TEST_CONFIG.in_dim))
}

/// A [`Runtime`] whose corpus entry `i` has Pal `pals[i]` and similarity
/// `scores[i]` to the image at `query.png` in the returned directory.
///
/// The caller must hold the returned [`tempfile::TempDir`] to keep the
/// temporary directory alive for the duration of the test.
pub fn runtime_with_corpus(pals: &[Pal], scores: &[f32]) -> (tempfile::TempDir, Runtime) {
    let tmp = tempfile::tempdir().unwrap();
    let artifacts = tmp.path().join("artifacts");
    std::fs::create_dir(&artifacts).unwrap();

    let image = solid_image(QUERY_RGB);
    image.save(tmp.path().join("query.png")).unwrap();

    let head = write_projection(&artifacts, TEST_CONFIG);
    let query = query_for(&head, &image);
    write_index(&artifacts, TEST_CONFIG.out_dim, vectors_with_scores(&query, scores));
    write_corpus(&artifacts, pals);

    let runtime = runtime_in(tmp.path());
    (tmp, runtime)
}

/// Writer appending to a shared buffer, for capturing log output.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a debug-level subscriber installed for this thread and
/// return everything it logged.
pub fn capture_logs(f: impl FnOnce()) -> String {
    let buf = SharedBuf::default();
    let writer = buf.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    let bytes = buf.0.lock().unwrap().clone();
    String::from_utf8_lossy(&bytes).into_owned()
}
