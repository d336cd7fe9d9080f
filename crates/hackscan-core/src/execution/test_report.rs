//! Test-count parsing
//!
//! Recognizes the summary lines of Jest, Vitest, pytest, `go test` and
//! `cargo test`. Unknown formats yield `None`; the caller then relies on
//! the exit code alone.

use once_cell::sync::Lazy;
use regex::Regex;

/// Tests run, passed and failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCounts {
    pub run: u32,
    pub passed: u32,
    pub failed: u32,
}

impl TestCounts {
    fn add(&mut self, other: Self) {
        self.run += other.run;
        self.passed += other.passed;
        self.failed += other.failed;
    }
}

static COUNT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(\d+)\s+(passed|failed|errors?|total)").ok());
static JEST_SUMMARY: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^\s*Tests:?\s+(.+)$").ok());
static PYTEST_SUMMARY: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^=+\s+(.*\d+\s+(?:passed|failed).*?)\s+in\s+[\d.]+s").ok());
static CARGO_SUMMARY: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed").ok());

fn counts_in(fragment: &str) -> TestCounts {
    let mut counts = TestCounts::default();
    let mut total = None;
    if let Some(re) = COUNT.as_ref() {
        for caps in re.captures_iter(fragment) {
            let n: u32 = caps[1].parse().unwrap_or(0);
            match &caps[2] {
                "passed" => counts.passed += n,
                "failed" | "error" | "errors" => counts.failed += n,
                _ => total = Some(n),
            }
        }
    }
    counts.run = total.unwrap_or(counts.passed + counts.failed);
    counts
}

fn jest_or_vitest(output: &str) -> Option<TestCounts> {
    let re = JEST_SUMMARY.as_ref()?;
    output.lines().rev().find_map(|line| {
        let summary = re.captures(line)?.get(1)?.as_str();
        let mut counts = counts_in(summary);
        // vitest prints the total as "(5)"
        if let Some(total) = summary
            .rsplit_once('(')
            .and_then(|(_, rest)| rest.trim_end_matches(')').trim().parse().ok())
        {
            counts.run = total;
        }
        (counts.run > 0).then_some(counts)
    })
}

fn pytest(output: &str) -> Option<TestCounts> {
    let re = PYTEST_SUMMARY.as_ref()?;
    output
        .lines()
        .rev()
        .find_map(|line| Some(counts_in(re.captures(line)?.get(1)?.as_str())))
}

fn cargo(output: &str) -> Option<TestCounts> {
    let re = CARGO_SUMMARY.as_ref()?;
    let mut total: Option<TestCounts> = None;
    for caps in re.captures_iter(output) {
        let passed = caps[1].parse().unwrap_or(0);
        let failed = caps[2].parse().unwrap_or(0);
        total.get_or_insert_with(TestCounts::default).add(TestCounts {
            run: passed + failed,
            passed,
            failed,
        });
    }
    total
}

fn go(output: &str) -> Option<TestCounts> {
    let per_test = |prefix: &str| {
        let n = output.lines().filter(|l| l.trim_start().starts_with(prefix)).count();
        u32::try_from(n).unwrap_or(u32::MAX)
    };
    let (passed, failed) = (per_test("--- PASS:"), per_test("--- FAIL:"));
    if passed + failed > 0 {
        return Some(TestCounts {
            run: passed + failed,
            passed,
            failed,
        });
    }
    // without -v only package lines are printed
    let packages = |prefix: &str| {
        let n = output
            .lines()
            .filter(|l| l.starts_with(prefix) && l[prefix.len()..].starts_with(char::is_whitespace))
            .count();
        u32::try_from(n).unwrap_or(u32::MAX)
    };
    let (passed, failed) = (packages("ok"), packages("FAIL"));
    (passed + failed > 0).then_some(TestCounts {
        run: passed + failed,
        passed,
        failed,
    })
}

/// Parse test counts from combined test output
#[must_use]
pub fn parse_test_counts(output: &str) -> Option<TestCounts> {
    jest_or_vitest(output)
        .or_else(|| pytest(output))
        .or_else(|| cargo(output))
        .or_else(|| go(output))
}
