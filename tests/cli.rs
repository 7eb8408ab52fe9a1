use assert_cmd::Command;
use predicates::prelude::*;

fn pgbloat() -> Command {
    let mut cmd = Command::cargo_bin("pgbloat").unwrap();
    cmd.env_remove("POSTGRES_HOST")
        .env_remove("POSTGRES_PORT")
        .env_remove("POSTGRES_DATABASE")
        .env_remove("POSTGRES_USER")
        .env_remove("POSTGRES_PASSWORD");
    cmd
}

#[test]
fn prints_version() {
    pgbloat()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("pgbloat "));
}

#[test]
fn schema_filters_are_mutually_exclusive() {
    pgbloat()
        .args([
            "scan",
            "-d",
            "app",
            "-u",
            "postgres",
            "--schema",
            "sales",
            "--exclude-schema",
            "archive",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("mutually exclusive"));
}

#[test]
fn invalid_size_threshold_fails_before_connecting() {
    pgbloat()
        .args([
            "report",
            "-d",
            "app",
            "-u",
            "postgres",
            "--min-wasted-size",
            "plenty",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--min-wasted-size"));
}

#[test]
fn unqualified_table_is_rejected() {
    pgbloat()
        .args(["scan", "-d", "app", "-u", "postgres", "--table", "orders"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("schema qualified"));
}

#[test]
fn unknown_format_is_rejected() {
    pgbloat()
        .args(["-f", "xml", "scan", "-d", "app", "-u", "postgres"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}
