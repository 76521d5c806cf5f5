use std::{fs, path::PathBuf};

use koto_lang::{elaborate, parse, util::Diagnostic};

fn corpus(kind: &str) -> Vec<PathBuf> {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/corpus")
        .join(kind);
    let mut paths = fs::read_dir(&dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "koto"))
        .collect::<Vec<_>>();
    paths.sort();
    assert!(!paths.is_empty(), "no corpus files in {}", dir.display());
    paths
}

fn diagnostics(text: &str) -> Vec<Diagnostic> {
    let parsed = parse(text);
    let elaborated = elaborate(&parsed).unwrap();
    parsed
        .diagnostics
        .into_iter()
        .chain(elaborated.diagnostics)
        .collect()
}

#[test]
fn success_corpus_has_no_errors() {
    _ = tracing_subscriber::fmt::try_init();
    for path in corpus("success") {
        let text = fs::read_to_string(&path).unwrap();
        let errors = diagnostics(&text)
            .into_iter()
            .filter(Diagnostic::is_error)
            .collect::<Vec<_>>();
        assert!(errors.is_empty(), "{}: {errors:?}", path.display());
    }
}

#[test]
fn failure_corpus_reports_errors() {
    _ = tracing_subscriber::fmt::try_init();
    for path in corpus("failure") {
        let text = fs::read_to_string(&path).unwrap();
        assert!(
            diagnostics(&text).iter().any(Diagnostic::is_error),
            "{} elaborated without errors",
            path.display()
        );
    }
}

#[test]
fn success_corpus_builds() {
    _ = tracing_subscriber::fmt::try_init();
    for path in corpus("success") {
        let text = fs::read_to_string(&path).unwrap();
        let term = elaborate(&parse(&text)).unwrap().term;
        let anf = koto_lang::backend::anf(&term).unwrap();
        let code = koto_lang::backend::generate(&anf).unwrap().code;
        assert!(code.contains("console.log("), "{}", path.display());
    }
}
