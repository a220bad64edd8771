//! Migration file discovery.

use super::MigrationError;
use std::cmp::Ordering;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::Chars;
use tokio::fs;
use tracing::debug;

/// One `.sql` file of one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub app: String,
    /// File name without the `.sql` extension.
    pub id: String,
    pub path: PathBuf,
}

impl MigrationFile {
    pub async fn read(&self) -> Result<String, MigrationError> {
        fs::read_to_string(&self.path)
            .await
            .map_err(|e| MigrationError::io(&self.path, e))
    }
}

/// Every application directory under `root` with its migrations, apps in
/// natural order. Directories without `.sql` files are skipped.
pub async fn discover(root: &Path) -> Result<Vec<(String, Vec<MigrationFile>)>, MigrationError> {
    let mut apps = Vec::new();
    let mut entries = fs::read_dir(root)
        .await
        .map_err(|e| MigrationError::io(root, e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| MigrationError::io(root, e))?
    {
        let path = entry.path();
        let is_dir = fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .map_err(|e| MigrationError::io(&path, e))?;
        if !is_dir {
            continue;
        }
        if let Some(app) = path.file_name().and_then(|n| n.to_str()) {
            apps.push(app.to_string());
        }
    }
    apps.sort_by(|a, b| natural_cmp(a, b).then_with(|| a.cmp(b)));

    let mut discovered = Vec::with_capacity(apps.len());
    for app in apps {
        let files = discover_app(root, &app).await?;
        if files.is_empty() {
            debug!(app = %app, "No migrations found, skipping");
            continue;
        }
        discovered.push((app, files));
    }
    Ok(discovered)
}

/// Migrations of one application, in apply order.
pub async fn discover_app(root: &Path, app: &str) -> Result<Vec<MigrationFile>, MigrationError> {
    let dir = root.join(app);
    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(MigrationError::UnknownApp(app.to_string()));
        }
        Err(e) => return Err(MigrationError::io(&dir, e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| MigrationError::io(&dir, e))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }
        let is_file = fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .map_err(|e| MigrationError::io(&path, e))?;
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if is_file && !id.is_empty() {
            files.push(MigrationFile {
                app: app.to_string(),
                id: id.to_string(),
                path: path.clone(),
            });
        }
    }
    files.sort_by(|a, b| natural_cmp(&a.id, &b.id).then_with(|| a.id.cmp(&b.id)));
    Ok(files)
}

/// Compare names treating digit runs as numbers, so `2_b` sorts before `10_a`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let ord = compare_numbers(&take_digits(&mut left), &take_digits(&mut right));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(l), Some(r)) => {
                if l != r {
                    return l.cmp(&r);
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.next_if(char::is_ascii_digit) {
        digits.push(c);
    }
    digits
}

/// Arbitrary-length digit runs: fewer significant digits is smaller.
fn compare_numbers(a: &str, b: &str) -> Ordering {
    let a_trimmed = a.trim_start_matches('0');
    let b_trimmed = b.trim_start_matches('0');
    a_trimmed
        .len()
        .cmp(&b_trimmed.len())
        .then_with(|| a_trimmed.cmp(b_trimmed))
        .then_with(|| a.len().cmp(&b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_cmp() {
        let mut names = vec!["10_index", "2_add_col", "1_init", "02_zero", "1_alpha"];
        names.sort_by(|a, b| natural_cmp(a, b).then_with(|| a.cmp(b)));
        assert_eq!(names, vec!["1_alpha", "1_init", "2_add_col", "02_zero", "10_index"]);

        assert_eq!(natural_cmp("a", "a"), Ordering::Equal);
        assert_eq!(natural_cmp("a", "ab"), Ordering::Less);
        assert_eq!(
            natural_cmp("99999999999999999999999_x", "100000000000000000000000_x"),
            Ordering::Less
        );
    }

    #[tokio::test]
    async fn test_discover_app_orders_numerically() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("core");
        std::fs::create_dir(&app).unwrap();
        for name in ["10_index.sql", "1_init.sql", "2_add_col.sql", "notes.txt"] {
            std::fs::write(app.join(name), "SELECT 1;").unwrap();
        }
        std::fs::create_dir(app.join("nested.sql")).unwrap();

        let files = discover_app(dir.path(), "core").await.unwrap();
        let ids: Vec<&str> = files.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["1_init", "2_add_col", "10_index"]);
        assert!(files.iter().all(|f| f.app == "core"));
    }

    #[tokio::test]
    async fn test_discover_skips_empty_apps() {
        let dir = tempfile::tempdir().unwrap();
        for app in ["billing", "auth", "empty"] {
            std::fs::create_dir(dir.path().join(app)).unwrap();
        }
        std::fs::write(dir.path().join("billing/1_init.sql"), "").unwrap();
        std::fs::write(dir.path().join("auth/1_init.sql"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();

        let apps = discover(dir.path()).await.unwrap();
        let names: Vec<&str> = apps.iter().map(|(app, _)| app.as_str()).collect();
        assert_eq!(names, vec!["auth", "billing"]);
    }

    #[tokio::test]
    async fn test_unknown_app() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover_app(dir.path(), "missing").await.unwrap_err();
        assert!(matches!(err, MigrationError::UnknownApp(app) if app == "missing"));
    }

    #[tokio::test]
    async fn test_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover(&dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, MigrationError::Io { .. }));
    }
}
