//! Host and tag lists from the command line and from files

use std::io::BufRead;

/// Split a comma separated list, dropping empty items
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read one item per line; `#` starts a comment, blank lines are skipped
pub fn parse_list(reader: impl BufRead) -> std::io::Result<Vec<String>> {
    let mut items = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let item = line.split('#').next().unwrap_or_default().trim();
        if !item.is_empty() {
            items.push(item.to_string());
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("web,,prod,"), vec!["web", "prod"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_parse_list_strips_comments() {
        let input = "web1  # frontend\n\n# all db hosts\n  db1\n";
        assert_eq!(parse_list(input.as_bytes()).unwrap(), vec!["web1", "db1"]);
    }
}
