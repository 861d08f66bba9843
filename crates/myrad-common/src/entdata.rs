// entdata.rs — BSP entity string parsing
//
// The entity lump is a sequence of { "key" "value" ... } blocks. The
// lighting tool only reads it, so entities are flat key/value maps.

use crate::mathlib::Vec3;

#[derive(Debug, Clone, Default)]
pub struct Entity {
    pub pairs: Vec<(String, String)>,
}

impl Entity {
    pub fn value(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn classname(&self) -> &str {
        self.value("classname").unwrap_or("")
    }

    pub fn float_value(&self, key: &str) -> Option<f32> {
        self.value(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn int_value(&self, key: &str) -> Option<i32> {
        self.value(key).and_then(|v| v.trim().parse().ok())
    }

    /// Parse up to three whitespace-separated floats, zero-filling the
    /// rest. "_light" style keys carry 1, 3, or 4 components.
    pub fn vector_value(&self, key: &str) -> Option<Vec3> {
        let v = self.value(key)?;
        let mut out = [0.0f32; 3];
        let mut n = 0;
        for (i, tok) in v.split_whitespace().take(3).enumerate() {
            out[i] = tok.parse().ok()?;
            n = i + 1;
        }
        if n == 0 {
            return None;
        }
        // A single component means a grey scalar
        if n == 1 {
            out[1] = out[0];
            out[2] = out[0];
        }
        Some(out)
    }

    pub fn origin(&self) -> Vec3 {
        self.vector_value("origin").unwrap_or([0.0, 0.0, 0.0])
    }
}

/// Token scanner matching the engine's parser: whitespace-separated
/// words, quoted strings, // comments.
fn next_token(chars: &mut std::iter::Peekable<std::str::Chars>) -> Option<String> {
    loop {
        // Skip whitespace
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
            } else {
                break;
            }
        }
        // Skip // comments
        let &c = chars.peek()?;
        if c == '/' {
            let mut clone = chars.clone();
            clone.next();
            if clone.peek() == Some(&'/') {
                while let Some(&c) = chars.peek() {
                    chars.next();
                    if c == '\n' {
                        break;
                    }
                }
                continue;
            }
        }
        break;
    }

    let &c = chars.peek()?;
    if c == '"' {
        chars.next();
        let mut tok = String::new();
        for c in chars.by_ref() {
            if c == '"' {
                break;
            }
            tok.push(c);
        }
        return Some(tok);
    }
    if c == '{' || c == '}' {
        chars.next();
        return Some(c.to_string());
    }
    let mut tok = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() || c == '"' || c == '{' || c == '}' {
            break;
        }
        tok.push(c);
        chars.next();
    }
    Some(tok)
}

/// Parse the whole entity string. Malformed trailing data is an error:
/// a truncated entity lump means a corrupt map.
pub fn parse_entities(entstring: &str) -> Result<Vec<Entity>, String> {
    let mut chars = entstring.chars().peekable();
    let mut entities = Vec::new();

    while let Some(tok) = next_token(&mut chars) {
        if tok != "{" {
            return Err(format!("expected '{{' in entity string, got '{}'", tok));
        }
        let mut ent = Entity::default();
        loop {
            let key = next_token(&mut chars)
                .ok_or_else(|| "unexpected end of entity string".to_string())?;
            if key == "}" {
                break;
            }
            let value = next_token(&mut chars)
                .ok_or_else(|| format!("key '{}' without a value", key))?;
            ent.pairs.push((key, value));
        }
        entities.push(ent);
    }
    Ok(entities)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
{
"classname" "worldspawn"
"message" "test chamber"
}
{
"classname" "light"
"origin" "128 64 96"
"_light" "255 240 230 300"
"light" "250"
}
{
"classname" "light_spot"
"origin" "0 0 128"
"_cone" "35"
}
"#;

    #[test]
    fn test_parse_counts() {
        let ents = parse_entities(SAMPLE).unwrap();
        assert_eq!(ents.len(), 3);
        assert_eq!(ents[0].classname(), "worldspawn");
        assert_eq!(ents[1].classname(), "light");
    }

    #[test]
    fn test_origin_parse() {
        let ents = parse_entities(SAMPLE).unwrap();
        assert_eq!(ents[1].origin(), [128.0, 64.0, 96.0]);
    }

    #[test]
    fn test_scalar_light_becomes_grey() {
        let ents = parse_entities("{ \"_light\" \"200\" }").unwrap();
        assert_eq!(ents[0].vector_value("_light"), Some([200.0, 200.0, 200.0]));
    }

    #[test]
    fn test_float_value() {
        let ents = parse_entities(SAMPLE).unwrap();
        assert_eq!(ents[2].float_value("_cone"), Some(35.0));
    }

    #[test]
    fn test_unbalanced_is_error() {
        assert!(parse_entities("{ \"classname\" ").is_err());
    }

    #[test]
    fn test_comments_skipped() {
        let ents = parse_entities("// header\n{ \"a\" \"b\" }\n").unwrap();
        assert_eq!(ents.len(), 1);
        assert_eq!(ents[0].value("a"), Some("b"));
    }
}
