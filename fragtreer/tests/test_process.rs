use std::{error::Error, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;

#[test]
fn test_file_missing() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("fragtreer")?;

    cmd.arg("not_real.json").arg("-o").arg("-");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("NotFound"));
    Ok(())
}

#[test]
fn test_malformed_alphabet() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("fragtreer")?;

    cmd.arg("../test/data/glucose.json")
        .args(["-o", "-", "--alphabet", "CHNO7x"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("AlphabetError"));
    Ok(())
}

#[test]
fn test_negative_ppm() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("fragtreer")?;

    cmd.arg("../test/data/glucose.json")
        .args(["-o", "-", "--ms2-ppm=-5"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("is less than zero"));
    Ok(())
}

#[test]
fn test_run_glucose() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("fragtreer")?;
    cmd.env("RUST_LOG", "info");
    cmd.arg("../test/data/glucose.json")
        .args(["-o", "-", "-n", "1", "-t", "2"]);
    let result = cmd.assert().success();
    result
        .stdout(predicate::str::contains("\"score\""))
        .stdout(predicate::str::contains("C6H12O6"))
        .stderr(predicate::str::contains("Parent Candidates: 2"));
    Ok(())
}
