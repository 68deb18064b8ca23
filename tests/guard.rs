//! Guard scenarios: report shape, provenance lookup, and overrides.

mod common;

use common::{TestRepo, output_text};
use forked::config::GuardMode;
use forked::guard::{self, GuardOptions, OverrideSource, Scope};
use forked::overlay::{self, BuildOptions};
use forked::provenance::ProvenanceSource;
use forked::selection::SelectionRequest;

const CONTRACT: &str = r#"
[upstream]
branch = "trunk"

[patches]
order = ["patch/contract-update"]

[features.contract_update]
patches = ["patch/contract-update"]

[overlays.dev]
features = ["contract_update"]

[guards.sentinels]
must_match_upstream = ["api/contracts/**"]

[policy_overrides]
require_trailer = REQUIRE
allowed_values = [ALLOWED]
"#;

fn config(require_trailer: bool, allowed: &[&str]) -> String {
    let allowed: Vec<String> = allowed.iter().map(|v| format!("\"{v}\"")).collect();
    CONTRACT
        .replace("REQUIRE", if require_trailer { "true" } else { "false" })
        .replace("ALLOWED", &allowed.join(", "))
}

const ALL_SCOPES: &[&str] = &["sentinel", "size", "both_touched", "all"];

/// Build `overlay/dev`, whose contract file diverges from trunk.
fn prepare(t: &TestRepo, toml: &str) {
    t.configure(toml);
    t.upstream_commit("api/contracts/service.yaml", "base\n", "add contract");
    t.patch_branch(
        "patch/contract-update",
        "api/contracts/service.yaml",
        "base\nfeature change\n",
    );
    let out = t.forked(&["build", "--overlay", "dev", "--no-worktree"]);
    assert!(out.status.success(), "{}", output_text(&out));
}

fn guard(t: &TestRepo, mode: &str) -> std::process::Output {
    t.forked(&["guard", "--overlay", "overlay/dev", "--mode", mode])
}

/// Add an empty commit with an override trailer to the overlay tip.
fn commit_override(t: &TestRepo, value: &str) {
    t.git(&["checkout", "-q", "overlay/dev"]);
    t.git(&[
        "commit",
        "-q",
        "--allow-empty",
        "-m",
        &format!("override commit\n\nForked-Override: {value}"),
    ]);
    t.git(&["checkout", "-q", "trunk"]);
}

// ===========================================================================
// Report
// ===========================================================================

#[test]
fn report_includes_features_from_provenance_log() {
    let t = TestRepo::new();
    prepare(&t, &config(false, ALL_SCOPES));

    let out = guard(&t, "warn");
    assert!(out.status.success(), "{}", output_text(&out));

    let report = t.read_json(".forked/report.json");
    assert_eq!(report["report_version"], 2);
    assert_eq!(report["overlay"], "overlay/dev");
    assert_eq!(report["trunk"], "trunk");
    assert_eq!(report["features"]["source"], "provenance-log");
    assert_eq!(report["features"]["values"], serde_json::json!(["contract_update"]));
    assert_eq!(report["override"]["source"], "none");
    assert_eq!(report["override"]["enabled"], false);
    assert_eq!(
        report["violations"]["sentinels"]["must_match_upstream"],
        serde_json::json!(["api/contracts/service.yaml"])
    );
    assert_eq!(report["both_touched"], serde_json::json!([]));
    assert_eq!(report["size_caps"]["violations"], false);
    assert!(report.get("debug").is_none());

    let entry = t.guard_log().last().cloned().unwrap();
    assert_eq!(entry["overlay"], "overlay/dev");
    assert_eq!(entry["mode"], "warn");
    assert!(entry["override"].get("allowed_values").is_none());
}

#[test]
fn report_falls_back_to_derived_features() {
    let t = TestRepo::new();
    prepare(&t, &config(false, ALL_SCOPES));
    std::fs::remove_file(t.root.join(".forked/logs/forked-build.log")).unwrap();
    t.git(&["notes", "--ref", "refs/notes/forked-meta", "remove", "overlay/dev"]);

    let out = guard(&t, "warn");
    assert!(out.status.success(), "{}", output_text(&out));

    let report = t.read_json(".forked/report.json");
    assert_eq!(report["features"]["source"], "derived");
    assert_eq!(report["features"]["values"], serde_json::json!(["contract_update"]));
}

#[test]
fn note_is_used_when_log_is_missing() {
    let t = TestRepo::new();
    prepare(&t, &config(false, ALL_SCOPES));
    std::fs::remove_file(t.root.join(".forked/logs/forked-build.log")).unwrap();

    let outcome = guard::run_guard(
        &t.repo(),
        &forked::ForkedConfig::load_from_repo(&t.root).unwrap(),
        &GuardOptions {
            overlay: "overlay/dev".into(),
            ..GuardOptions::default()
        },
    )
    .unwrap();
    assert_eq!(outcome.report.features.source, ProvenanceSource::GitNote);
    assert_eq!(outcome.report.features.values, vec!["contract_update"]);
}

#[test]
fn verbose_writes_debug_and_lists_matches() {
    let t = TestRepo::new();
    prepare(&t, &config(false, ALL_SCOPES));

    let out = t.forked(&["guard", "--overlay", "overlay/dev", "--verbose"]);
    assert!(out.status.success(), "{}", output_text(&out));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("[guard] Sentinel matches:"), "{stdout}");
    assert!(stdout.contains("api/contracts/service.yaml"), "{stdout}");

    let report = t.read_json(".forked/report.json");
    assert_eq!(
        report["debug"]["sentinels"]["matched_must_match"],
        serde_json::json!(["api/contracts/service.yaml"])
    );
    assert_eq!(t.guard_log().last().unwrap()["verbose"], true);
}

#[test]
fn custom_output_path_is_honoured() {
    let t = TestRepo::new();
    prepare(&t, &config(false, ALL_SCOPES));

    let out = t.forked(&["guard", "--overlay", "overlay/dev", "--output", "out/guard.json"]);
    assert!(out.status.success(), "{}", output_text(&out));
    assert_eq!(t.read_json("out/guard.json")["report_version"], 2);
}

#[test]
fn missing_overlay_is_a_precondition_failure() {
    let t = TestRepo::new();
    prepare(&t, &config(false, ALL_SCOPES));

    let out = t.forked(&["guard", "--overlay", "overlay/nope"]);
    assert_eq!(out.status.code(), Some(4), "{}", output_text(&out));
}

// ===========================================================================
// Modes
// ===========================================================================

#[test]
fn block_mode_fails_on_any_violation() {
    let t = TestRepo::new();
    prepare(&t, &config(false, ALL_SCOPES));
    commit_override(&t, "all");

    let out = guard(&t, "block");
    assert_eq!(out.status.code(), Some(2), "{}", output_text(&out));
    assert!(t.root.join(".forked/report.json").exists());
}

#[test]
fn clean_overlay_passes_block_mode() {
    let t = TestRepo::new();
    prepare(&t, &config(false, ALL_SCOPES).replace("api/contracts/**", "nothing/**"));

    let out = guard(&t, "block");
    assert!(out.status.success(), "{}", output_text(&out));
    let report = t.read_json(".forked/report.json");
    assert_eq!(report["violations"], serde_json::json!({}));
}

#[test]
fn size_caps_and_both_touched_report_scopes() {
    let t = TestRepo::new();
    let toml = format!(
        "{}\n[guards.size_caps]\nmax_files = 1\n",
        config(false, ALL_SCOPES)
    );
    t.configure(&toml);
    t.upstream_commit("api/contracts/service.yaml", "base\n", "add contract");
    t.git(&["checkout", "-q", "-b", "patch/contract-update", "trunk"]);
    t.commit_file("api/contracts/service.yaml", "base\nfeature\n", "feature");
    t.commit_file("README.md", "patched readme\n", "readme");
    t.git(&["checkout", "-q", "trunk"]);
    let cfg = forked::ForkedConfig::load_from_repo(&t.root).unwrap();
    let repo = t.repo();
    overlay::build_overlay(
        &repo,
        &cfg,
        &BuildOptions {
            request: SelectionRequest::overlay("dev"),
            use_worktree: false,
            ..BuildOptions::default()
        },
    )
    .unwrap();
    t.upstream_commit("README.md", "upstream readme\n", "upstream readme");

    let outcome = guard::run_guard(
        &repo,
        &cfg,
        &GuardOptions {
            overlay: "dev".into(),
            mode: Some(GuardMode::Block),
            ..GuardOptions::default()
        },
    )
    .unwrap();

    let scopes: Vec<Scope> = outcome.report.violations.scopes().into_iter().collect();
    assert_eq!(scopes, vec![Scope::BothTouched, Scope::Sentinel, Scope::Size]);
    assert_eq!(
        outcome.report.violations.both_touched,
        Some(vec!["README.md".to_owned()])
    );
    let size = outcome.report.violations.size_caps.unwrap();
    assert_eq!(size.files, 2);
    assert_eq!(size.loc, 3);
    assert!(outcome.decision.fails);
    assert_eq!(outcome.enforce().unwrap_err().exit_code(), 2);
}

#[test]
fn must_diverge_fires_when_overlay_matches_trunk() {
    let t = TestRepo::new();
    let toml = config(false, ALL_SCOPES).replace(
        "[guards.sentinels]\nmust_match_upstream = [\"api/contracts/**\"]",
        "[guards.sentinels]\nmust_diverge_from_upstream = [\"README.md\", \"branding/**\"]",
    );
    prepare(&t, &toml);

    let cfg = forked::ForkedConfig::load_from_repo(&t.root).unwrap();
    let outcome = guard::run_guard(
        &t.repo(),
        &cfg,
        &GuardOptions {
            overlay: "overlay/dev".into(),
            ..GuardOptions::default()
        },
    )
    .unwrap();
    let sentinels = outcome.report.violations.sentinels.unwrap();
    assert_eq!(sentinels.must_diverge_from_upstream, vec!["README.md"]);
    assert!(sentinels.must_match_upstream.is_empty());
}

#[test]
fn must_match_fires_when_path_exists_on_one_side_only() {
    let t = TestRepo::new();
    let cfg = t.configure(&config(false, ALL_SCOPES));
    t.upstream_commit("api/contracts/service.yaml", "base\n", "add contract");
    t.git(&["checkout", "-q", "-b", "patch/contract-update", "trunk"]);
    t.git(&["rm", "-q", "api/contracts/service.yaml"]);
    t.git(&["commit", "-q", "-m", "drop service contract"]);
    t.commit_file("api/contracts/billing.yaml", "billing\n", "add billing contract");
    t.git(&["checkout", "-q", "trunk"]);
    let repo = t.repo();
    overlay::build_overlay(
        &repo,
        &cfg,
        &BuildOptions {
            request: SelectionRequest::overlay("dev"),
            use_worktree: false,
            ..BuildOptions::default()
        },
    )
    .unwrap();

    let outcome = guard::run_guard(
        &repo,
        &cfg,
        &GuardOptions {
            overlay: "overlay/dev".into(),
            ..GuardOptions::default()
        },
    )
    .unwrap();
    let sentinels = outcome.report.violations.sentinels.unwrap();
    assert_eq!(
        sentinels.must_match_upstream,
        vec![
            "api/contracts/billing.yaml".to_owned(),
            "api/contracts/service.yaml".to_owned(),
        ]
    );
}

#[test]
fn zero_size_caps_never_violate() {
    let t = TestRepo::new();
    let toml = format!(
        "{}\n[guards.size_caps]\nmax_files = 0\nmax_loc = 0\n",
        config(false, ALL_SCOPES).replace("api/contracts/**", "nothing/**")
    );
    let cfg = t.configure(&toml);
    t.git(&["checkout", "-q", "-b", "patch/contract-update", "trunk"]);
    for i in 0..40 {
        t.write(&format!("generated/file{i}.txt"), &"line\n".repeat(50));
    }
    t.git(&["add", "generated"]);
    t.git(&["commit", "-q", "-m", "large generated change"]);
    t.git(&["checkout", "-q", "trunk"]);
    let repo = t.repo();
    overlay::build_overlay(
        &repo,
        &cfg,
        &BuildOptions {
            request: SelectionRequest::overlay("dev"),
            use_worktree: false,
            ..BuildOptions::default()
        },
    )
    .unwrap();

    let outcome = guard::run_guard(
        &repo,
        &cfg,
        &GuardOptions {
            overlay: "overlay/dev".into(),
            mode: Some(GuardMode::Block),
            ..GuardOptions::default()
        },
    )
    .unwrap();
    let size = outcome.report.size_caps;
    assert!(!size.violations);
    assert_eq!(size.files_changed, 0);
    assert_eq!(size.loc, 0);
    assert!(outcome.report.violations.is_empty());
    assert!(!outcome.decision.fails);
}

// ===========================================================================
// Overrides
// ===========================================================================

#[test]
fn require_override_without_marker_fails() {
    let t = TestRepo::new();
    prepare(&t, &config(true, ALL_SCOPES));

    let out = guard(&t, "require-override");
    assert_eq!(out.status.code(), Some(2));
    assert!(
        output_text(&out).contains("[guard] Override required"),
        "{}",
        output_text(&out)
    );
}

#[test]
fn commit_override_allows_violation() {
    let t = TestRepo::new();
    prepare(&t, &config(true, ALL_SCOPES));
    assert_eq!(guard(&t, "require-override").status.code(), Some(2));

    commit_override(&t, "sentinel");
    let out = guard(&t, "require-override");
    assert!(out.status.success(), "{}", output_text(&out));

    let report = t.read_json(".forked/report.json");
    assert_eq!(report["override"]["source"], "commit");
    assert_eq!(report["override"]["values"], serde_json::json!(["sentinel"]));
    assert_eq!(report["override"]["applied"], true);
    assert_eq!(
        report["override"]["allowed_values"],
        serde_json::json!(["sentinel", "size", "both_touched", "all"])
    );
    assert_eq!(report["features"]["values"], serde_json::json!(["contract_update"]));
}

#[test]
fn disallowed_override_scope_fails() {
    let t = TestRepo::new();
    prepare(&t, &config(true, &["size"]));
    commit_override(&t, "sentinel");

    let out = guard(&t, "require-override");
    assert_eq!(out.status.code(), Some(2));
    assert!(output_text(&out).contains("not permitted"), "{}", output_text(&out));
}

#[test]
fn partial_override_names_the_missing_scope() {
    let t = TestRepo::new();
    prepare(&t, &config(true, ALL_SCOPES));
    commit_override(&t, "size");

    let out = guard(&t, "require-override");
    assert_eq!(out.status.code(), Some(2));
    assert!(output_text(&out).contains("missing: sentinel"), "{}", output_text(&out));
}

#[test]
fn tag_override_is_used_when_commit_has_none() {
    let t = TestRepo::new();
    prepare(&t, &config(true, ALL_SCOPES));
    assert_eq!(guard(&t, "require-override").status.code(), Some(2));

    t.git(&[
        "tag",
        "-a",
        "override-tag",
        "overlay/dev",
        "-m",
        "Forked-Override: sentinel",
    ]);
    let out = guard(&t, "require-override");
    assert!(out.status.success(), "{}", output_text(&out));

    let report = t.read_json(".forked/report.json");
    assert_eq!(report["override"]["source"], "tag");
    assert_eq!(report["override"]["ref"], "override-tag");
    assert_eq!(report["override"]["values"], serde_json::json!(["sentinel"]));
}

#[test]
fn note_override_is_the_last_fallback() {
    let t = TestRepo::new();
    prepare(&t, &config(true, ALL_SCOPES));
    t.git(&[
        "notes",
        "--ref",
        "refs/notes/forked/override",
        "add",
        "-m",
        "Forked-Override: sentinel",
        "overlay/dev",
    ]);

    let cfg = forked::ForkedConfig::load_from_repo(&t.root).unwrap();
    let outcome = guard::run_guard(
        &t.repo(),
        &cfg,
        &GuardOptions {
            overlay: "overlay/dev".into(),
            mode: Some(GuardMode::RequireOverride),
            ..GuardOptions::default()
        },
    )
    .unwrap();
    assert_eq!(outcome.report.override_.source, OverrideSource::Note);
    assert!(outcome.decision.applied);
    assert!(outcome.enforce().is_ok());
}

#[test]
fn commit_override_wins_over_tag() {
    let t = TestRepo::new();
    prepare(&t, &config(true, ALL_SCOPES));
    commit_override(&t, "size");
    t.git(&["tag", "-a", "t1", "overlay/dev", "-m", "Forked-Override: sentinel"]);

    let out = guard(&t, "require-override");
    assert_eq!(out.status.code(), Some(2));
    let report = t.read_json(".forked/report.json");
    assert_eq!(report["override"]["source"], "commit");
    assert_eq!(report["override"]["values"], serde_json::json!(["size"]));
}
