/// Replace `${ENV_VAR}` placeholders in raw config text.
///
/// `${VAR:-fallback}` uses `fallback` when `VAR` is unset or empty, and `$${`
/// emits a literal `${`. Unresolvable variables are left as-is.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

/// Same as [`substitute_env`] with an explicit variable lookup.
pub fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix("$${") {
            result.push_str("${");
            rest = after;
            continue;
        }

        let Some(body_start) = tail.strip_prefix("${") else {
            result.push('$');
            rest = &tail[1..];
            continue;
        };

        let Some(end) = body_start.find('}') else {
            // Unclosed placeholder: emit the remainder verbatim.
            result.push_str(tail);
            rest = "";
            break;
        };

        let body = &body_start[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match lookup(name).filter(|v| !v.is_empty() || fallback.is_none()) {
            Some(value) if !name.is_empty() => result.push_str(&value),
            _ => match fallback {
                Some(fallback) if !name.is_empty() => result.push_str(fallback),
                _ => {
                    result.push_str("${");
                    result.push_str(body);
                    result.push('}');
                },
            },
        }
        rest = &body_start[end + 1..];
    }

    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "TOKEN" => Some("s3cret".into()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(substitute_with("token=${TOKEN}", lookup), "token=s3cret");
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(substitute_with("${NOPE}", lookup), "${NOPE}");
    }

    #[test]
    fn fallback_for_missing_or_empty() {
        assert_eq!(substitute_with("${NOPE:-8080}", lookup), "8080");
        assert_eq!(substitute_with("${EMPTY:-x}", lookup), "x");
        assert_eq!(substitute_with("${TOKEN:-x}", lookup), "s3cret");
    }

    #[test]
    fn escaped_placeholder() {
        assert_eq!(substitute_with("$${TOKEN}", lookup), "${TOKEN}");
    }

    #[test]
    fn plain_dollars_and_unclosed() {
        assert_eq!(substitute_with("cost $5", lookup), "cost $5");
        assert_eq!(substitute_with("a ${TOKEN", lookup), "a ${TOKEN");
    }
}
