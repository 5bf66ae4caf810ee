/// Extraction operators run against the most recent response: field search,
/// instance lookup and tabular reports.
use crate::response::{NodeId, Response, Tree};

/// One field occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub value: String,
    pub node: NodeId,
    pub parent: Option<NodeId>,
}

/// `Find` arguments once the `Name[=Value]` text has been split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindQuery {
    pub field: String,
    pub expected: Option<String>,
    pub instance: Option<usize>,
}

impl FindQuery {
    /// Split `Name` or `Name=Value`. More than one `=` is not a valid query.
    pub fn parse(look: &str, instance: Option<usize>) -> Option<Self> {
        let parts: Vec<&str> = look.split('=').collect();
        match parts.as_slice() {
            [field] => Some(Self {
                field: field.to_string(),
                expected: None,
                instance,
            }),
            [field, value] => Some(Self {
                field: field.to_string(),
                expected: Some(value.to_string()),
                instance,
            }),
            _ => None,
        }
    }
}

/// Pre-order search below `scope` for nodes named `field`, or selectors whose
/// `Name` attribute is `field`, that carry text. A match is not searched
/// further. Stops once `limit` matches are collected.
pub fn find_all(tree: &Tree, scope: NodeId, field: &str, limit: Option<usize>) -> Vec<Match> {
    let mut results = Vec::new();
    collect(tree, scope, field, limit, &mut results);
    results
}

fn collect(tree: &Tree, id: NodeId, field: &str, limit: Option<usize>, results: &mut Vec<Match>) {
    let node = tree.node(id);
    let named = node.local == field || (node.local == "Selector" && node.attr("Name") == Some(field));
    if named {
        if let Some(text) = &node.text {
            results.push(Match {
                value: text.clone(),
                node: id,
                parent: node.parent,
            });
            return;
        }
    }

    for &child in &node.children {
        collect(tree, child, field, limit, results);
        if limit.is_some_and(|n| results.len() >= n) {
            return;
        }
    }
}

/// Resolve a `Find` query.
///
/// Without an expected value the requested instance (default first) must
/// exist. With an expected value and no instance any equal occurrence
/// matches and the first one is returned. With both, that instance must
/// exist and be equal.
pub fn find(tree: &Tree, scope: NodeId, query: &FindQuery) -> Option<Match> {
    let instance = match (query.instance, &query.expected) {
        (Some(n), _) => Some(n),
        (None, None) => Some(1),
        (None, Some(_)) => None,
    };

    let matches = find_all(tree, scope, &query.field, instance);
    match instance {
        Some(n) => {
            let found = matches.into_iter().nth(n.checked_sub(1)?)?;
            match &query.expected {
                Some(expected) if &found.value != expected => None,
                _ => Some(found),
            }
        }
        None => {
            let expected = query.expected.as_deref()?;
            matches.into_iter().find(|m| m.value == expected)
        }
    }
}

/// Build the report table, or `None` when no field has displayable data.
///
/// `*` stands for every observed field not listed explicitly. Fields with a
/// value count other than the number of response chunks are skipped, as are
/// fields with no data. Rows are filtered by `filter`, sorted as strings and
/// the filter column is hidden.
pub fn report(
    response: &Response,
    scope: Option<NodeId>,
    requested: &[String],
    filter: Option<(&str, &str)>,
) -> Option<String> {
    let tree = response.tree.as_ref();
    let mut fields = expand_star(requested, tree);

    let (mut key, value) = match filter {
        Some((k, v)) => (k.to_string(), v.to_string()),
        None => (String::new(), String::new()),
    };
    if !key.is_empty() && !fields.contains(&key) {
        fields.push(key.clone());
    }

    let chunks = response.chunks();
    let mut columns: Vec<(String, Vec<String>)> = Vec::new();
    for field in fields {
        let values: Vec<String> = match tree {
            Some(tree) => find_all(tree, scope.unwrap_or(tree.root()), &field, None)
                .into_iter()
                .map(|m| m.value)
                .collect(),
            None => Vec::new(),
        };

        if values.is_empty() {
            log::warn!("No data for field '{}', skipping", field);
        } else if values.len() != chunks {
            log::warn!("Multi-value field '{}', skipping", field);
        } else {
            columns.push((field, values));
        }
    }

    if columns.is_empty() || (columns.len() == 1 && columns[0].0 == key) {
        return None;
    }

    let mut rows: Vec<Vec<String>> = (0..chunks)
        .map(|i| columns.iter().map(|(_, values)| values[i].clone()).collect())
        .collect();

    match columns.iter().position(|(name, _)| name == &key) {
        Some(pos) => rows.retain(|row| row[pos] == value),
        None => key.clear(),
    }
    rows.sort();

    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, (name, _))| {
            rows.iter()
                .map(|row| row[i].chars().count())
                .chain(std::iter::once(name.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let visible: Vec<usize> = (0..columns.len())
        .filter(|&i| columns[i].0 != key)
        .collect();
    let render = |cells: Vec<String>| -> String {
        let line: Vec<String> = visible
            .iter()
            .zip(cells)
            .map(|(&i, cell)| format!("{:<width$}", cell, width = widths[i]))
            .collect();
        line.join("  ").trim_end().to_string()
    };

    let mut table = String::from("\n");
    table.push_str(&render(visible.iter().map(|&i| columns[i].0.clone()).collect()));
    table.push('\n');
    table.push_str(&render(visible.iter().map(|&i| "-".repeat(widths[i])).collect()));
    table.push('\n');
    for row in &rows {
        table.push_str(&render(visible.iter().map(|&i| row[i].clone()).collect()));
        table.push('\n');
    }
    table.push('\n');

    log::debug!("Report: {} rows", rows.len());
    Some(table)
}

fn expand_star(requested: &[String], tree: Option<&Tree>) -> Vec<String> {
    let Some(pos) = requested.iter().position(|f| f == "*") else {
        return requested.to_vec();
    };

    let observed = tree.map(Tree::fields).unwrap_or_default();
    let mut fields: Vec<String> = requested[..pos].to_vec();
    fields.extend(observed.into_iter().filter(|f| !requested.contains(f)));
    fields.extend(requested[pos + 1..].iter().filter(|f| *f != "*").cloned());
    fields
}
