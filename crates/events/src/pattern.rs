//! Glob matching for channel patterns (`*`, `?`, `[...]`, `\` escapes).

/// Whether `text` matches the glob `pattern`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
            continue;
        }
        if pi < p.len() {
            if let Some(next) = step(&p, pi, t[ti]) {
                pi = next;
                ti += 1;
                continue;
            }
        }
        match star {
            Some((sp, st)) => {
                pi = sp + 1;
                ti = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Match one (non-`*`) pattern token at `pi` against `c`; returns the next
/// pattern position on success.
fn step(p: &[char], pi: usize, c: char) -> Option<usize> {
    match p[pi] {
        '?' => Some(pi + 1),
        '\\' if pi + 1 < p.len() => (p[pi + 1] == c).then_some(pi + 2),
        '[' => match class_end(p, pi) {
            Some(end) => class_matches(&p[pi + 1..end], c).then_some(end + 1),
            None => (c == '[').then_some(pi + 1),
        },
        literal => (literal == c).then_some(pi + 1),
    }
}

fn class_end(p: &[char], open: usize) -> Option<usize> {
    let mut i = open + 1;
    while i < p.len() {
        match p[i] {
            '\\' => i += 2,
            ']' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn class_matches(class: &[char], c: char) -> bool {
    let (negated, body) = match class.first() {
        Some('^') => (true, &class[1..]),
        _ => (false, class),
    };

    let mut found = false;
    let mut i = 0;
    while i < body.len() {
        if body[i] == '\\' && i + 1 < body.len() {
            found |= body[i + 1] == c;
            i += 2;
        } else if i + 2 < body.len() && body[i + 1] == '-' {
            let (lo, hi) = if body[i] <= body[i + 2] {
                (body[i], body[i + 2])
            } else {
                (body[i + 2], body[i])
            };
            found |= lo <= c && c <= hi;
            i += 3;
        } else {
            found |= body[i] == c;
            i += 1;
        }
    }

    found != negated
}

#[cfg(test)]
mod tests {
    use super::glob_match;

    #[test]
    fn literal_and_wildcards() {
        assert!(glob_match("orders:events", "orders:events"));
        assert!(glob_match("orders:*", "orders:abc:effects"));
        assert!(glob_match("*:effects", "d1:i1:effects"));
        assert!(glob_match("h?llo", "hello"));
        assert!(!glob_match("h?llo", "hllo"));
        assert!(!glob_match("orders:*", "invoices:1"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn classes_ranges_and_escapes() {
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("v[0-9]", "v7"));
        assert!(glob_match(r"a\*b", "a*b"));
        assert!(!glob_match(r"a\*b", "axb"));
    }
}
