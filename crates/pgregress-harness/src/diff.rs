//! Diff rendering for expected/actual statement output.

/// Render a line diff between expected and actual output.
///
/// Lines are paired by position, matching how result rows are compared; surplus
/// lines on either side are listed as pure removals or additions.
#[must_use]
pub fn render_diff(expected: &str, actual: &str) -> String {
    if expected == actual {
        return String::from("[identical]");
    }

    let expected: Vec<&str> = expected.lines().collect();
    let actual: Vec<&str> = actual.lines().collect();
    let mut out = String::new();
    out.push_str("--- expected\n");
    out.push_str("+++ actual\n");
    for i in 0..expected.len().max(actual.len()) {
        match (expected.get(i), actual.get(i)) {
            (Some(e), Some(a)) if e == a => {}
            (e, a) => {
                out.push_str(&format!("@@ line {} @@\n", i + 1));
                if let Some(e) = e {
                    out.push_str(&format!("-{e}\n"));
                }
                if let Some(a) = a {
                    out.push_str(&format!("+{a}\n"));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text() {
        assert_eq!(render_diff("a\nb", "a\nb"), "[identical]");
    }

    #[test]
    fn changed_and_missing_lines() {
        let diff = render_diff("1 | haha\n2 | x", "1 | hehe");
        assert_eq!(
            diff,
            "--- expected\n+++ actual\n@@ line 1 @@\n-1 | haha\n+1 | hehe\n@@ line 2 @@\n-2 | x\n"
        );
    }

    #[test]
    fn surplus_actual_lines_are_additions() {
        let diff = render_diff("", "extra");
        assert!(diff.ends_with("@@ line 1 @@\n+extra\n"));
    }
}
