use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{Skill, SkillSet};

/// Load every `*.md` skill in `dir`, sorted by file name. A missing
/// directory yields no skills; unreadable or empty files are skipped.
pub fn load_dir(dir: &Path) -> Vec<Skill> {
    if !dir.is_dir() {
        return Vec::new();
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot read skills directory");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "md"))
        .collect();
    paths.sort();

    let skills: Vec<Skill> = paths.iter().filter_map(|p| load_skill(p)).collect();
    debug!(dir = %dir.display(), count = skills.len(), "loaded skills");
    skills
}

/// Load several directories; earlier directories win name clashes.
pub fn load_dirs(dirs: &[PathBuf]) -> SkillSet {
    SkillSet::merge(dirs.iter().map(|d| load_dir(d)))
}

fn load_skill(path: &Path) -> Option<Skill> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read skill file");
            return None;
        }
    };
    let stem = path.file_stem().and_then(|s| s.to_str())?.to_string();
    let (mut fields, body) = parse_frontmatter(&raw);

    if body.trim().is_empty() {
        return None;
    }

    Some(Skill {
        name: fields.remove("name").unwrap_or(stem),
        description: fields.remove("description").unwrap_or_default(),
        trigger: fields.remove("trigger").filter(|t| !t.is_empty()),
        template: body,
        frontmatter: fields,
    })
}

/// Split a `---` delimited front-matter block from the body. Only flat
/// `key: value` lines are understood.
pub fn parse_frontmatter(raw: &str) -> (BTreeMap<String, String>, String) {
    let normalized = raw.replace("\r\n", "\n");
    let Some(after_start) = normalized.strip_prefix("---\n") else {
        return (BTreeMap::new(), normalized);
    };
    let Some(end) = after_start.find("\n---") else {
        return (BTreeMap::new(), normalized);
    };

    let header = &after_start[..end];
    let body = after_start[end + 4..]
        .trim_start_matches('-')
        .trim_start()
        .to_string();

    let fields = header
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_string(), unquote(value.trim()).to_string()))
        })
        .collect();

    (fields, body)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "conductor_skills_test_{}",
            uuid::Uuid::now_v7()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn parses_frontmatter_fields() {
        let raw = "---\nname: brainstorming\ndescription: \"Explore design ideas\"\ntrigger: '(design|brainstorm|plan)'\nauthor: ops\n---\nLet's brainstorm: {{input}}\n";
        let (fields, body) = parse_frontmatter(raw);
        assert_eq!(fields["name"], "brainstorming");
        assert_eq!(fields["description"], "Explore design ideas");
        assert_eq!(fields["trigger"], "(design|brainstorm|plan)");
        assert_eq!(fields["author"], "ops");
        assert_eq!(body, "Let's brainstorm: {{input}}\n");
    }

    #[test]
    fn no_frontmatter() {
        let (fields, body) = parse_frontmatter("Just a template");
        assert!(fields.is_empty());
        assert_eq!(body, "Just a template");
    }

    #[test]
    fn load_dir_reads_md_files() {
        let dir = temp_dir();
        fs::write(
            dir.join("tdd.md"),
            "---\ndescription: Test driven development\ntrigger: (test|tdd)\n---\nWrite tests for {{input}}",
        )
        .unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();
        fs::write(dir.join("empty.md"), "---\nname: empty\n---\n").unwrap();

        let skills = load_dir(&dir);
        assert_eq!(skills.len(), 1);
        let skill = &skills[0];
        assert_eq!(skill.name, "tdd");
        assert_eq!(skill.trigger.as_deref(), Some("(test|tdd)"));
        assert_eq!(skill.template, "Write tests for {{input}}");
        assert!(skill.frontmatter.is_empty());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_dir_is_empty() {
        assert!(load_dir(Path::new("/nonexistent/conductor/skills")).is_empty());
    }

    #[test]
    fn load_dirs_first_seen_wins() {
        let first = temp_dir();
        let second = temp_dir();
        fs::write(first.join("plan.md"), "---\ndescription: first\n---\nA").unwrap();
        fs::write(second.join("plan.md"), "---\ndescription: second\n---\nB").unwrap();
        fs::write(second.join("review.md"), "Review {{input}}").unwrap();

        let set = load_dirs(&[first.clone(), second.clone()]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("plan").unwrap().description, "first");
        assert!(set.get("review").is_ok());

        fs::remove_dir_all(&first).ok();
        fs::remove_dir_all(&second).ok();
    }
}
