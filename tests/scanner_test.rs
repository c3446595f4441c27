use chrono::{Duration, Utc};

use claude_sentinel::scanner::{LocalLogScanner, ScanError};

mod common;
use common::{create_test_jsonl, setup_claude_home};

fn assistant_line(input: u64, output: u64) -> String {
    format!(
        r#"{{"type":"assistant","message":{{"model":"claude-sonnet-4-5","usage":{{"input_tokens":{input},"output_tokens":{output},"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}}},"sessionId":"s1","timestamp":"2026-08-06T10:00:00Z"}}"#
    )
}

#[test]
fn corrupt_lines_are_skipped_not_fatal() {
    let (home, project_dir) = setup_claude_home().unwrap();

    // Ten lines: line 4 is not JSON, line 7 is not an assistant record.
    let mut lines = Vec::new();
    for i in 0..10u64 {
        match i {
            3 => lines.push("not json".to_string()),
            6 => lines.push(r#"{"type":"user"}"#.to_string()),
            _ => lines.push(assistant_line(100, 50)),
        }
    }
    create_test_jsonl(&project_dir, "session.jsonl", &lines.join("\n")).unwrap();

    let scanner = LocalLogScanner::new(home.path());
    let aggregate = scanner
        .scan_recent(Utc::now() - Duration::hours(1))
        .unwrap();

    // Only the eight valid assistant lines count.
    assert_eq!(aggregate.records, 8);
    assert_eq!(aggregate.skipped_lines, 2);
    assert_eq!(aggregate.tokens.input_tokens, 800);
    assert_eq!(aggregate.tokens.output_tokens, 400);
}

#[test]
fn missing_projects_directory_is_an_error() {
    let home = tempfile::TempDir::new().unwrap();
    let scanner = LocalLogScanner::new(home.path());
    assert!(matches!(
        scanner.scan_recent(Utc::now() - Duration::hours(1)),
        Err(ScanError::NoLogDirectory(_))
    ));
}

#[test]
fn no_files_in_window_is_an_error() {
    let (home, _project_dir) = setup_claude_home().unwrap();
    let scanner = LocalLogScanner::new(home.path());
    assert!(matches!(
        scanner.scan_recent(Utc::now() - Duration::hours(1)),
        Err(ScanError::NoLogFiles)
    ));
}

#[test]
fn files_modified_before_the_window_are_ignored() {
    let (home, project_dir) = setup_claude_home().unwrap();
    create_test_jsonl(&project_dir, "session.jsonl", &assistant_line(10, 5)).unwrap();

    let scanner = LocalLogScanner::new(home.path());
    // The scan window opens in the future, after the file's mtime.
    assert!(matches!(
        scanner.scan_recent(Utc::now() + Duration::hours(1)),
        Err(ScanError::NoLogFiles)
    ));
}

#[test]
fn usage_accumulates_across_projects_and_files() {
    let (home, project_dir) = setup_claude_home().unwrap();
    create_test_jsonl(&project_dir, "a.jsonl", &assistant_line(10, 5)).unwrap();
    create_test_jsonl(&project_dir, "b.jsonl", &assistant_line(20, 10)).unwrap();

    let other_project = home.path().join("projects").join("-home-user-other");
    std::fs::create_dir_all(&other_project).unwrap();
    create_test_jsonl(&other_project, "c.jsonl", &assistant_line(30, 15)).unwrap();

    let scanner = LocalLogScanner::new(home.path());
    let aggregate = scanner
        .scan_recent(Utc::now() - Duration::hours(1))
        .unwrap();

    assert_eq!(aggregate.files_scanned, 3);
    assert_eq!(aggregate.records, 3);
    assert_eq!(aggregate.tokens.input_tokens, 60);
    assert_eq!(aggregate.tokens.output_tokens, 30);
}

#[test]
fn blank_lines_are_ignored_silently() {
    let (home, project_dir) = setup_claude_home().unwrap();
    let content = format!("{}\n\n\n{}\n", assistant_line(1, 1), assistant_line(2, 2));
    create_test_jsonl(&project_dir, "session.jsonl", &content).unwrap();

    let scanner = LocalLogScanner::new(home.path());
    let aggregate = scanner
        .scan_recent(Utc::now() - Duration::hours(1))
        .unwrap();

    assert_eq!(aggregate.records, 2);
    assert_eq!(aggregate.skipped_lines, 0);
}
