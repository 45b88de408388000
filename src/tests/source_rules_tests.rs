use super::*;

fn source(rel: &str, text: &str) -> SourceFile {
    SourceFile {
        rel: PathBuf::from(rel),
        text: text.to_string(),
        test_only: false,
    }
}

fn rules(found: &[Violation]) -> Vec<&'static str> {
    found.iter().map(|v| v.rule).collect()
}

#[test]
fn test_unwrap_in_shipped_code_is_flagged() {
    let text = "fn load() {\n    // never .unwrap() here\n    let x = read().unwrap();\n}\n";
    let found = check(&source("src/pool.rs", text));

    assert_eq!(rules(&found), vec!["no-panic"]);
    assert_eq!(found[0].at, "src/pool.rs:3");
}

#[test]
fn test_cfg_test_items_are_exempt_but_code_after_them_is_not() {
    let text = "pub fn real() {}\n\
                \n\
                #[cfg(test)]\n\
                impl Fake {\n\
                fn now(&self) -> u8 {\n\
                *self.0.lock().unwrap()\n\
                }\n\
                }\n\
                \n\
                fn after() {\n\
                thing.expect(\"boom\");\n\
                }\n";
    let found = check(&source("src/clock.rs", text));

    assert_eq!(rules(&found), vec!["no-panic"]);
    assert_eq!(found[0].at, "src/clock.rs:11");
}

#[test]
fn test_test_only_files_may_unwrap() {
    let mut file = source("src/tests/pool_tests.rs", "fn t() { a.unwrap(); }\n");
    file.test_only = true;
    assert!(check(&file).is_empty());
}

#[test]
fn test_dead_code_allow_and_blocking_sleep_are_flagged_in_tests_too() {
    let sleep = concat!("std::thread", "::sleep(d);");
    let text = format!("#[allow(dead_code)]\nfn idle() {{\n    {}\n}}\n", sleep);
    let mut file = source("src/tests/idle_tests.rs", &text);
    file.test_only = true;

    assert_eq!(rules(&check(&file)), vec!["dead-code", "blocking-sleep"]);
}

#[test]
fn test_length_counts_non_empty_lines() {
    let at_limit = "x\n\n".repeat(MAX_SOURCE_LINES);
    assert!(check(&source("src/a.rs", &at_limit)).is_empty());

    let over = format!("{}x\n", at_limit);
    assert_eq!(rules(&check(&source("src/a.rs", &over))), vec!["file-length"]);
}

#[test]
fn test_gated_module_files_resolve_from_declaring_file() {
    let lib = "pub mod network;\n\
               #[cfg(test)]\n\
               pub(crate) mod test_support;\n\
               #[cfg(test)]\n\
               #[path = \"tests/lib_tests.rs\"]\n\
               mod tests;\n";
    assert_eq!(
        test_gated_modules(Path::new("src/lib.rs"), lib),
        vec![PathBuf::from("src/test_support.rs")]
    );

    let network = "#[cfg(test)]\nmod scripted;\n";
    assert_eq!(
        test_gated_modules(Path::new("src/network/mod.rs"), network),
        vec![PathBuf::from("src/network/scripted.rs")]
    );
    assert_eq!(
        test_gated_modules(Path::new("src/network.rs"), network),
        vec![PathBuf::from("src/network/scripted.rs")]
    );
}
