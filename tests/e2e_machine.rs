use std::io::Write;
use std::process::{Command, Output, Stdio};

fn imlc(args: &[&str], src: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_imlc"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn imlc");

    child
        .stdin
        .as_mut()
        .expect("stdin not available")
        .write_all(src.as_bytes())
        .expect("failed to feed IML source");

    child.wait_with_output().expect("failed to wait for imlc")
}

fn run_iml(src: &str, input: &str) -> String {
    let out = imlc(&["--run", "--input", input], src);
    assert!(
        out.status.success(),
        "imlc failed.\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8(out.stdout).expect("imlc stdout is not UTF-8")
}

#[test]
fn e2e_factorial_runs() {
    let src = include_str!("fixtures/factorial.iml");
    assert_eq!(run_iml(src, "5"), "rec = 120\nloop = 120\n");
    assert_eq!(run_iml(src, "1"), "rec = 1\nloop = 1\n");
    assert_eq!(run_iml(src, "10"), "rec = 3628800\nloop = 3628800\n");
}

#[test]
fn e2e_records_run() {
    let src = include_str!("fixtures/records.iml");
    assert_eq!(
        run_iml(src, ""),
        "area(b) = 12\nb.high.y = 8\nb.high.x = 6\narea(b) = 30\n"
    );
}

#[test]
fn e2e_swap_through_references() {
    let src = include_str!("fixtures/swap.iml");
    assert_eq!(run_iml(src, "3 9"), "a = 9\nb = 3\n");
}

#[test]
fn e2e_division_families() {
    let src = include_str!("fixtures/divisions.iml");
    let expected = [
        "(-7 divT 2) = -3",
        "(-7 divF 2) = -4",
        "(-7 divE 2) = -4",
        "(-7 modT 2) = -1",
        "(-7 modF 2) = 1",
        "(-7 modE 2) = 1",
        "q = -3",
    ];
    let got = run_iml(src, "");
    assert_eq!(got.lines().collect::<Vec<_>>(), expected);
}

#[test]
fn e2e_debugin_reads_supplied_tokens() {
    let src = "program p() global var x: int32; var b: bool \
               do debugin x; debugin b; if b then debugout x * 2 else debugout x endif \
               endprogram";
    assert_eq!(run_iml(src, "21 true"), "(x * 2) = 42\n");
    assert_eq!(run_iml(src, "21 false"), "x = 21\n");
}

#[test]
fn e2e_missing_input_is_reported() {
    let src = include_str!("fixtures/factorial.iml");
    let out = imlc(&["--run"], src);
    assert!(!out.status.success());
    let err = String::from_utf8_lossy(&out.stderr);
    assert!(err.contains("no input left for n"), "stderr was: {err}");
}

#[test]
fn e2e_division_by_zero_stops_the_machine() {
    let src = "program p() global var x: int32 do x := 0; debugout 1 divT x endprogram";
    let out = imlc(&["--run"], src);
    assert!(!out.status.success());
    let err = String::from_utf8_lossy(&out.stderr);
    assert!(err.contains("division by zero"), "stderr was: {err}");
}
