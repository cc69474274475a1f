//! Slurm hostlist expressions, e.g. `nid[001-003,007],gpu[1-2]-ib,login1`.

use crate::error::{Result, RigError};

/// Largest number of hosts an expression may expand to.
pub const MAX_HOSTS: usize = 65_536;

/// Expand a hostlist expression into hostnames, in order.
pub fn expand_hostlist(expr: &str) -> Result<Vec<String>> {
    let mut hosts = Vec::new();
    for item in split_top_level(expr)? {
        if item.is_empty() {
            continue;
        }
        expand_item(&item, &mut hosts)?;
    }
    Ok(hosts)
}

/// Split on commas that are not inside brackets.
fn split_top_level(expr: &str) -> Result<Vec<String>> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in expr.trim().chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| RigError::parse("hostlist", format!("unbalanced ']' in '{}'", expr)))?;
                current.push(c);
            }
            ',' if depth == 0 => items.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(RigError::parse("hostlist", format!("unbalanced '[' in '{}'", expr)));
    }
    items.push(current);
    Ok(items)
}

fn expand_item(item: &str, out: &mut Vec<String>) -> Result<()> {
    let open = match item.find('[') {
        Some(i) => i,
        None => {
            out.push(item.to_string());
            return Ok(());
        }
    };
    let close = item[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| RigError::parse("hostlist", format!("unterminated range in '{}'", item)))?;
    let prefix = &item[..open];
    let suffix = &item[close + 1..];

    for part in item[open + 1..close].split(',') {
        for value in expand_range(part, item)? {
            expand_item(&format!("{}{}{}", prefix, value, suffix), out)?;
            if out.len() > MAX_HOSTS {
                return Err(RigError::parse(
                    "hostlist",
                    format!("'{}' expands to more than {} hosts", item, MAX_HOSTS),
                ));
            }
        }
    }
    Ok(())
}

/// `007` -> `["007"]`, `01-03` -> `["01", "02", "03"]` (width of the start kept).
fn expand_range(part: &str, item: &str) -> Result<Vec<String>> {
    let bad = || RigError::parse("hostlist", format!("bad range '{}' in '{}'", part, item));
    let (start, end) = match part.split_once('-') {
        Some((a, b)) => (a, b),
        None => (part, part),
    };
    let width = start.len();
    let lo: u64 = start.parse().map_err(|_| bad())?;
    let hi: u64 = end.parse().map_err(|_| bad())?;
    if hi < lo {
        return Err(bad());
    }
    if hi - lo >= MAX_HOSTS as u64 {
        return Err(RigError::parse(
            "hostlist",
            format!("range '{}' in '{}' exceeds {} hosts", part, item, MAX_HOSTS),
        ));
    }
    Ok((lo..=hi).map(|n| format!("{:0width$}", n, width = width)).collect())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(expr: &str) -> Vec<String> {
        expand_hostlist(expr).unwrap()
    }

    #[test]
    fn plain_names() {
        assert_eq!(hosts("login1"), vec!["login1"]);
        assert_eq!(hosts("a,b"), vec!["a", "b"]);
        assert!(hosts("").is_empty());
    }

    #[test]
    fn ranges_keep_padding() {
        assert_eq!(hosts("nid[001-003,007]"), vec!["nid001", "nid002", "nid003", "nid007"]);
        assert_eq!(hosts("n[8-10]"), vec!["n8", "n9", "n10"]);
    }

    #[test]
    fn mixed_list_with_suffix() {
        assert_eq!(
            hosts("nid[01-02],gpu[1-2]-ib,login1"),
            vec!["nid01", "nid02", "gpu1-ib", "gpu2-ib", "login1"]
        );
    }

    #[test]
    fn multiple_bracket_groups() {
        assert_eq!(hosts("r[1-2]n[1-2]"), vec!["r1n1", "r1n2", "r2n1", "r2n2"]);
    }

    #[test]
    fn malformed_expressions() {
        assert!(expand_hostlist("nid[001-").is_err());
        assert!(expand_hostlist("nid]1[").is_err());
        assert!(expand_hostlist("nid[5-1]").is_err());
        assert!(expand_hostlist("nid[a-b]").is_err());
    }

    #[test]
    fn oversized_ranges_are_rejected() {
        assert!(expand_hostlist("nid[0-99999999999]").is_err());
        assert!(expand_hostlist("r[1-1000]n[1-1000]").is_err());
        assert_eq!(expand_hostlist("n[1-65536]").unwrap().len(), MAX_HOSTS);
    }
}
