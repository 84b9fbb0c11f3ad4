//! `json-pushes` wire model
//!
//! The Mercurial push log answers with an object keyed by push id:
//!
//! ```json
//! {"16920": {"date": 1300000000, "user": "pusher@example.com",
//!            "changesets": [{"node": "…40 hex…", "author": "…", "desc": "…"}]}}
//! ```
//!
//! Version 2 of the endpoint wraps the same map in `{"lastpushid": N, "pushes": {…}}`;
//! both shapes are accepted.

use super::PushLogError;
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Changeset {
    pub node: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub desc: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct RawPush {
    date: i64,
    #[serde(default)]
    user: String,
    #[serde(default)]
    changesets: Vec<Changeset>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PushDocument {
    Wrapped { pushes: BTreeMap<String, RawPush> },
    Plain(BTreeMap<String, RawPush>),
}

/// One push with its changesets
#[derive(Debug, Clone, PartialEq)]
pub struct Push {
    pub id: String,
    pub date: i64,
    pub user: String,
    pub changesets: Vec<Changeset>,
}

/// Parse a `json-pushes?full=1` response, ordered by push date
pub fn parse_pushes(bytes: &[u8]) -> Result<Vec<Push>, PushLogError> {
    let document: PushDocument = serde_json::from_slice(bytes)?;
    let raw = match document {
        PushDocument::Wrapped { pushes } => pushes,
        PushDocument::Plain(pushes) => pushes,
    };

    let mut pushes: Vec<Push> = raw
        .into_iter()
        .map(|(id, p)| Push {
            id,
            date: p.date,
            user: p.user,
            changesets: p.changesets,
        })
        .collect();

    // Numeric push id breaks date ties; map order would sort "9" after "10"
    pushes.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| push_id_number(&a.id).cmp(&push_id_number(&b.id)))
    });

    Ok(pushes)
}

fn push_id_number(id: &str) -> u64 {
    id.parse().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "10": {"date": 1300000200, "user": "b@example.com",
               "changesets": [{"node": "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", "author": "Bee", "desc": "Bug 2"}]},
        "9":  {"date": 1300000100, "user": "a@example.com",
               "changesets": [{"node": "aaaaaaaaaaaa1111111111111111111111111111", "author": "Ay", "desc": "Bug 1", "files": ["x"]},
                              {"node": "aaaaaaaaaaaa2222222222222222222222222222", "author": "Ay", "desc": "Bug 1b"}]}
    }"#;

    #[test]
    fn test_parse_plain_document_sorted_by_date() {
        let pushes = parse_pushes(SAMPLE.as_bytes()).unwrap();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[0].id, "9");
        assert_eq!(pushes[0].user, "a@example.com");
        assert_eq!(pushes[0].changesets.len(), 2);
        assert_eq!(pushes[1].changesets[0].author, "Bee");
    }

    #[test]
    fn test_parse_wrapped_document() {
        let wrapped = format!(r#"{{"lastpushid": 10, "pushes": {}}}"#, SAMPLE);
        let pushes = parse_pushes(wrapped.as_bytes()).unwrap();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[1].date, 1300000200);
    }

    #[test]
    fn test_equal_dates_ordered_by_push_id() {
        let doc = r#"{"10": {"date": 5, "user": "u", "changesets": []},
                      "9":  {"date": 5, "user": "u", "changesets": []}}"#;
        let ids: Vec<String> = parse_pushes(doc.as_bytes())
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["9", "10"]);
    }

    #[test]
    fn test_empty_document() {
        assert!(parse_pushes(b"{}").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_document_is_error() {
        assert!(parse_pushes(b"<html>502 Bad Gateway</html>").is_err());
        assert!(parse_pushes(br#"{"1": {"user": "no date"}}"#).is_err());
        assert!(parse_pushes(b"[1, 2]").is_err());
    }
}
