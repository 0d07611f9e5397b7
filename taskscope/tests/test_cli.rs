//! Drive the installed binary over a recorded trace.

use std::process::Command;

use taskscope::trace::build::TraceBuilder;
use taskscope::trace::Record;

#[test]
fn binary_builds_a_model_and_honours_the_filter() {
    let dir = tempfile::tempdir().expect("temp dir");

    let mut builder = TraceBuilder::new();
    let image = builder.add_image("/usr/bin/target");
    let file = builder.add_file("src/main.c", image);
    let kept = builder.add_function("work", "void work()", file, 5);
    let dropped = builder.add_function("skipped_helper", "void skipped_helper()", file, 40);
    builder.add_batch(
        0,
        &[
            Record::CallEnter { tsc: 1, rbp: 0x1000, rsp: 0x0f00, function: kept },
            Record::CallEnter { tsc: 2, rbp: 0x0f00, rsp: 0x0e00, function: dropped },
            Record::Ret { tsc: 3, rsp: 0x0ef0, function: dropped },
            Record::Ret { tsc: 4, rsp: 0x0ff0, function: kept },
        ],
    );
    std::fs::write(dir.path().join("trace.tsc"), builder.finish()).expect("write trace");

    std::fs::write(
        dir.path().join("source.yaml"),
        "flags:\n  processCallsByDefault: true\n",
    )
    .expect("write source config");
    std::fs::write(dir.path().join("filter.yaml"), "function:\n  exclude: ['^skipped_']\n")
        .expect("write filter config");

    let status = Command::new(env!("CARGO_BIN_EXE_taskscope"))
        .current_dir(dir.path())
        .args(["trace.tsc", "--db", "model.db"])
        .status()
        .expect("run taskscope");
    assert!(status.success());

    let db = rusqlite::Connection::open(dir.path().join("model.db")).expect("open model");
    let calls: i64 =
        db.query_row("SELECT COUNT(*) FROM Call", [], |row| row.get(0)).expect("calls");
    assert_eq!(calls, 1, "the filtered function leaves no call");

    let functions: i64 = db
        .query_row("SELECT COUNT(*) FROM Function WHERE Name = 'skipped_helper'", [], |row| {
            row.get(0)
        })
        .expect("functions");
    assert_eq!(functions, 0, "filtered functions are not interned");

    let threads: i64 =
        db.query_row("SELECT COUNT(*) FROM Thread", [], |row| row.get(0)).expect("threads");
    assert_eq!(threads, 1);
}

#[test]
fn binary_rejects_a_non_trace_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    std::fs::write(dir.path().join("trace.tsc"), b"not a trace").expect("write junk");
    std::fs::write(dir.path().join("source.yaml"), "{}\n").expect("write source config");
    std::fs::write(dir.path().join("filter.yaml"), "{}\n").expect("write filter config");

    let status = Command::new(env!("CARGO_BIN_EXE_taskscope"))
        .current_dir(dir.path())
        .arg("trace.tsc")
        .status()
        .expect("run taskscope");
    assert!(!status.success());
}
