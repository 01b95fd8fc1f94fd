use assert_cmd::Command;
use assert_fs::prelude::*;
use color_eyre::eyre::{Context, Result};
use predicates::str::contains;

fn ocm() -> Result<Command> {
    Command::cargo_bin("ocm").context("locate ocm binary")
}

#[test_log::test]
fn help_lists_all_three_subcommands() -> Result<()> {
    ocm()?
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("get"))
        .stdout(contains("sign"))
        .stdout(contains("verify"));
    Ok(())
}

#[test_log::test]
fn get_with_unparseable_reference_exits_with_parse_error_code() -> Result<()> {
    // No component name can be isolated from a bare scheme-only input.
    ocm()?.args(["get", "https://"]).assert().failure().code(2);
    Ok(())
}

#[test_log::test]
fn get_with_valid_reference_but_no_registered_provider_exits_with_unsupported_repository_code() -> Result<()> {
    // The core crate intentionally implements no concrete OCI/CTF transport, so any
    // reference this binary can parse still fails to dispatch.
    ocm()?
        .args(["get", "ghcr.io/acme//github.com/acme/widget:1.0.0"])
        .assert()
        .failure()
        .code(3);
    Ok(())
}

#[test_log::test]
fn get_requires_a_reference_argument() -> Result<()> {
    ocm()?.arg("get").assert().failure();
    Ok(())
}

#[test_log::test]
fn sign_requires_signer_spec_flag() -> Result<()> {
    ocm()?
        .args(["sign", "ghcr.io/acme//github.com/acme/widget:1.0.0"])
        .assert()
        .failure();
    Ok(())
}

#[test_log::test]
fn sign_with_missing_signer_spec_file_fails() -> Result<()> {
    ocm()?
        .args([
            "sign",
            "ghcr.io/acme//github.com/acme/widget:1.0.0",
            "--signer-spec",
            "/nonexistent/credentials.json",
        ])
        .assert()
        .failure();
    Ok(())
}

#[test_log::test]
fn verify_with_credential_file_but_no_provider_exits_with_unsupported_repository_code() -> Result<()> {
    let temp = assert_fs::TempDir::new().context("create temp dir")?;
    let creds = temp.child("verifier.json");
    creds
        .write_str(r#"{"public_key_pem": "-----BEGIN PUBLIC KEY-----\nstub\n-----END PUBLIC KEY-----\n"}"#)
        .context("write credential file")?;

    ocm()?
        .args([
            "verify",
            "ghcr.io/acme//github.com/acme/widget:1.0.0",
            "--verifier-spec",
        ])
        .arg(creds.path())
        .assert()
        .failure()
        .code(3);
    Ok(())
}
