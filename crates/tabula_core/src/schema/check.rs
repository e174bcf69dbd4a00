#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub expression: String,
    pub enforced: bool,
}

/// `chk_<8 hex of the expression hash>`, suffixed `_1`, `_2`, ... while taken.
pub fn generate_check_name(expression: &str, taken: impl Fn(&str) -> bool) -> String {
    let digest = blake3::hash(expression.as_bytes());
    let base = format!("chk_{}", &hex::encode(digest.as_bytes())[..8]);
    if !taken(&base) {
        return base;
    }
    (1u32..)
        .map(|n| format!("{base}_{n}"))
        .find(|name| !taken(name))
        .unwrap_or(base)
}
