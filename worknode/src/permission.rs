//! Glob-based command permission checking.
//!
//! A command string is split into its individual call expressions (pipes,
//! `;`, `&&`, `||`, subshells, command substitutions) and every one of
//! them is evaluated against the rule table independently. Chaining a
//! forbidden command onto an allowed one therefore never widens authority.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use globset::Glob;

/// Permission action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
}

/// A single permission rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub pattern: String,
    pub action: Action,
}

/// Checks commands against an ordered rule table.
///
/// Evaluation is last-match-wins, so rule order is part of the policy:
/// the `*` default (if present) is placed first and all other patterns
/// follow in lexicographic order.
#[derive(Debug, Clone)]
pub struct Checker {
    rules: Vec<Rule>,
}

impl Checker {
    /// Build a checker from a pattern -> "allow"/"deny" map. Anything that
    /// is not "allow" (case-insensitive) is treated as deny.
    pub fn new(patterns: &BTreeMap<String, String>) -> Self {
        let mut rules = Vec::with_capacity(patterns.len());

        // The "*" default must be evaluated first so specific rules can
        // override it.
        if let Some(action) = patterns.get("*") {
            rules.push(Rule {
                pattern: "*".into(),
                action: parse_action(action),
            });
        }

        // BTreeMap iteration gives the remaining patterns in sorted order.
        for (pattern, action) in patterns {
            if pattern != "*" {
                rules.push(Rule {
                    pattern: pattern.clone(),
                    action: parse_action(action),
                });
            }
        }

        Self { rules }
    }

    /// Check whether a command is allowed. Returns the denying rule and the
    /// offending call expression in the error when it is not.
    pub fn check(&self, command: &str) -> Result<()> {
        let command = command.trim();
        if command.is_empty() {
            bail!("empty command");
        }

        for expr in split_call_expressions(command)? {
            let invocation = normalize_invocation(&expr)?;
            if invocation.is_empty() {
                continue;
            }

            let (action, matched) = self.evaluate_rules(&invocation);
            if action == Action::Deny {
                match matched {
                    Some(pattern) => {
                        bail!("command denied by rule '{}': {}", pattern, invocation)
                    }
                    None => bail!("command denied (no matching allow rule): {}", invocation),
                }
            }
        }

        Ok(())
    }

    /// Convenience wrapper around [`Checker::check`].
    pub fn is_allowed(&self, command: &str) -> bool {
        self.check(command).is_ok()
    }

    /// Walk all rules in order; each match overwrites the running decision.
    fn evaluate_rules(&self, invocation: &str) -> (Action, Option<&str>) {
        let mut action = Action::Deny;
        let mut matched = None;
        for rule in &self.rules {
            if match_pattern(&rule.pattern, invocation) {
                action = rule.action;
                matched = Some(rule.pattern.as_str());
            }
        }
        (action, matched)
    }

    #[cfg(test)]
    pub(crate) fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

fn parse_action(s: &str) -> Action {
    if s.eq_ignore_ascii_case("allow") {
        Action::Allow
    } else {
        Action::Deny
    }
}

/// Match one rule pattern against a normalized invocation.
///
/// - `*` matches anything.
/// - A pattern without `*` matches only on exact equality.
/// - A pattern ending in `*` matches by prefix of the stem.
/// - Everything else is a doublestar-style glob.
fn match_pattern(pattern: &str, invocation: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == invocation;
    }
    if let Some(stem) = pattern.strip_suffix('*') {
        if !stem.contains('*') {
            return invocation.starts_with(stem);
        }
    }
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(invocation),
        Err(_) => false,
    }
}

/// Split a shell program into call expressions.
///
/// The scanner is quote- and escape-aware and treats `;`, `&`, `|`,
/// newlines, subshell parentheses, backticks, and `$(...)` as expression
/// boundaries, so every command that could run is policed individually.
fn split_call_expressions(command: &str) -> Result<Vec<String>> {
    let mut exprs = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        if in_single {
            current.push(c);
            if c == '\'' {
                in_single = false;
            }
            continue;
        }
        if in_double {
            current.push(c);
            match c {
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                '"' => in_double = false,
                _ => {}
            }
            continue;
        }

        match c {
            '\'' => {
                in_single = true;
                current.push(c);
            }
            '"' => {
                in_double = true;
                current.push(c);
            }
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ';' | '&' | '|' | '\n' | '(' | ')' | '`' => {
                // "$(" introduces a substitution; the "$" is not part of
                // the preceding invocation.
                if c == '(' && current.ends_with('$') {
                    current.pop();
                }
                flush_expr(&mut exprs, &mut current);
            }
            _ => current.push(c),
        }
    }

    if in_single || in_double {
        bail!("failed to parse command: unterminated quote");
    }
    flush_expr(&mut exprs, &mut current);
    Ok(exprs)
}

fn flush_expr(exprs: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        exprs.push(trimmed.to_string());
    }
    current.clear();
}

/// Reduce a call expression to its canonical single-spaced form:
/// tokens split shell-style and rejoined, redirections dropped.
fn normalize_invocation(expr: &str) -> Result<String> {
    let Some(tokens) = shlex::split(expr) else {
        bail!("failed to parse command: {}", expr);
    };

    let mut kept: Vec<String> = Vec::with_capacity(tokens.len());
    let mut skip_next = false;
    for token in tokens {
        if skip_next {
            skip_next = false;
            continue;
        }
        match classify_redirect(&token) {
            Redirect::Operator => skip_next = true,
            Redirect::SelfContained => {}
            Redirect::None => kept.push(token),
        }
    }
    Ok(kept.join(" "))
}

enum Redirect {
    /// A bare operator like `>`; the following token is its target.
    Operator,
    /// Operator with an attached target (`>out.log`, `2>&1`).
    SelfContained,
    None,
}

/// Redirection targets are not part of the invocation being policed.
fn classify_redirect(token: &str) -> Redirect {
    let stripped = token
        .strip_prefix('2')
        .or_else(|| token.strip_prefix('1'))
        .or_else(|| token.strip_prefix('&'))
        .unwrap_or(token);

    let rest = if let Some(r) = stripped.strip_prefix(">>") {
        r
    } else if let Some(r) = stripped.strip_prefix('>') {
        r
    } else if let Some(r) = stripped.strip_prefix('<') {
        r
    } else {
        return Redirect::None;
    };

    if rest.is_empty() {
        Redirect::Operator
    } else {
        Redirect::SelfContained
    }
}
