//! Message variant selection and placeholder substitution.

use rand::Rng;
use rand::seq::SliceRandom;

use crate::model::{Contact, Variable};

/// Pick one non-blank variant uniformly at random.
pub fn pick_variant<'a, R: Rng + ?Sized>(variants: &'a [String], rng: &mut R) -> Option<&'a str> {
    let candidates: Vec<&str> = variants
        .iter()
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .collect();
    candidates.choose(rng).copied()
}

/// Replace `{name}`, `{firstName}`, `{email}`, `{number}` and settings-defined
/// `{key}` tokens. Unknown tokens are left as they are.
pub fn render(template: &str, contact: &Contact, variables: &[Variable]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let token = &after[..close];
        if token.contains('{') {
            // Not a token; rescan from the inner brace.
            out.push('{');
            rest = after;
            continue;
        }
        match lookup(token, contact, variables) {
            Some(value) => out.push_str(value),
            None => {
                out.push('{');
                out.push_str(token);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

fn lookup<'a>(token: &str, contact: &'a Contact, variables: &'a [Variable]) -> Option<&'a str> {
    match token {
        "name" => Some(contact.name.as_str()),
        "firstName" => Some(contact.first_name()),
        "email" => Some(contact.email.as_deref().unwrap_or("")),
        "number" => Some(contact.number.as_str()),
        key => variables.iter().find(|v| v.key == key).map(|v| v.value.as_str()),
    }
}

/// Render a picked variant for `contact` and append their custom suffix.
pub fn compose<R: Rng + ?Sized>(variants: &[String], contact: &Contact, variables: &[Variable], rng: &mut R) -> Option<String> {
    let body = render(pick_variant(variants, rng)?, contact, variables);
    Some(match contact.custom_message.as_deref().map(str::trim) {
        Some(suffix) if !suffix.is_empty() => format!("{body}\n{suffix}"),
        _ => body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn contact() -> Contact {
        Contact {
            email: Some("ana@example.com".into()),
            ..Contact::new("Ana Lima", "5511999990000")
        }
    }

    #[test]
    fn renders_known_tokens_and_keeps_unknown() {
        let vars = vec![Variable {
            key: "promo".into(),
            value: "20% off".into(),
        }];
        let out = render("Hi {firstName} ({name}, {email}, {number}): {promo} {unknown} {", &contact(), &vars);
        assert_eq!(
            out,
            "Hi Ana (Ana Lima, ana@example.com, 5511999990000): 20% off {unknown} {"
        );
    }

    #[test]
    fn stray_open_brace_does_not_hide_the_next_token() {
        assert_eq!(render("{ {name}", &contact(), &[]), "{ Ana Lima");
        assert_eq!(render("{{firstName}}", &contact(), &[]), "{Ana}");
        assert_eq!(render("a { b {c", &contact(), &[]), "a { b {c");
    }

    #[test]
    fn blank_variants_are_never_picked() {
        let variants = vec!["".to_string(), "  ".to_string(), "only".to_string()];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(pick_variant(&variants, &mut rng), Some("only"));
        }
        assert_eq!(pick_variant(&["".to_string()], &mut rng), None);
    }

    #[test]
    fn every_variant_gets_picked_eventually() {
        let variants: Vec<String> = (0..5).map(|i| format!("v{i}")).collect();
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(pick_variant(&variants, &mut rng).unwrap());
        }
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn compose_appends_custom_suffix() {
        let mut c = contact();
        c.custom_message = Some("See you!".into());
        let mut rng = StdRng::seed_from_u64(1);
        let msg = compose(&["Hello {firstName}".to_string()], &c, &[], &mut rng).unwrap();
        assert_eq!(msg, "Hello Ana\nSee you!");
    }
}
