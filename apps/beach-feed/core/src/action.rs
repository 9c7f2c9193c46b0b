use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What the client asked the feed to do.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Open,
    Undo,
    Query,
    Like,
    Dislike,
    AddedToCart,
    DeletedFromCart,
    /// Any unrecognised `action_type`; handled as a generic swipe.
    Other(String),
}

impl ActionKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "open" => ActionKind::Open,
            "undo" => ActionKind::Undo,
            "query" => ActionKind::Query,
            "like" => ActionKind::Like,
            "dislike" => ActionKind::Dislike,
            "added_to_cart" => ActionKind::AddedToCart,
            "deleted_from_cart" => ActionKind::DeletedFromCart,
            other => ActionKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::Open => "open",
            ActionKind::Undo => "undo",
            ActionKind::Query => "query",
            ActionKind::Like => "like",
            ActionKind::Dislike => "dislike",
            ActionKind::AddedToCart => "added_to_cart",
            ActionKind::DeletedFromCart => "deleted_from_cart",
            ActionKind::Other(raw) => raw,
        }
    }

    /// Swipes are recorded against a product and then advance the cursor.
    pub fn is_swipe(&self) -> bool {
        matches!(
            self,
            ActionKind::Like
                | ActionKind::Dislike
                | ActionKind::AddedToCart
                | ActionKind::DeletedFromCart
                | ActionKind::Other(_)
        )
    }
}

/// Free-text and/or structured filter scoping a recommendation fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Map<String, Value>>,
}

impl ActionQuery {
    pub fn is_empty(&self) -> bool {
        let no_text = self
            .text
            .as_deref()
            .map(|text| text.trim().is_empty())
            .unwrap_or(true);
        let no_filter = self.filter.as_ref().map(Map::is_empty).unwrap_or(true);
        no_text && no_filter
    }

    /// Whether a product record falls inside this scope. Every filter key
    /// must equal the record's field; text must appear, ignoring case, in
    /// some string field.
    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        let filter_ok = self
            .filter
            .iter()
            .flatten()
            .all(|(key, expected)| fields.get(key) == Some(expected));
        let text_ok = match self.text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => {
                let needle = text.to_lowercase();
                fields
                    .values()
                    .filter_map(Value::as_str)
                    .any(|value| value.to_lowercase().contains(&needle))
            }
            _ => true,
        };
        filter_ok && text_ok
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub kind: ActionKind,
    pub product_id: Option<String>,
    pub query: Option<ActionQuery>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            product_id: None,
            query: None,
        }
    }

    pub fn with_product(mut self, product_id: impl Into<String>) -> Self {
        self.product_id = Some(product_id.into());
        self
    }

    pub fn with_query(mut self, query: ActionQuery) -> Self {
        self.query = Some(query);
        self
    }

    /// Query payload, ignoring an empty `{}` sent by clients that always
    /// include the field.
    pub fn scoped_query(&self) -> Option<&ActionQuery> {
        self.query.as_ref().filter(|query| !query.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_known_kinds() {
        assert_eq!(ActionKind::parse("open"), ActionKind::Open);
        assert_eq!(ActionKind::parse("added_to_cart"), ActionKind::AddedToCart);
        assert_eq!(
            ActionKind::parse("deleted_from_cart"),
            ActionKind::DeletedFromCart
        );
        assert_eq!(ActionKind::parse("undo"), ActionKind::Undo);
    }

    #[test_timeout::timeout]
    fn unknown_kind_is_a_swipe() {
        let kind = ActionKind::parse("purchase");
        assert_eq!(kind, ActionKind::Other("purchase".into()));
        assert!(kind.is_swipe());
        assert_eq!(kind.as_str(), "purchase");
        assert!(!ActionKind::Open.is_swipe());
        assert!(!ActionKind::Undo.is_swipe());
    }

    #[test_timeout::timeout]
    fn blank_query_is_not_scoped() {
        let action = Action::new(ActionKind::Open).with_query(ActionQuery {
            text: Some("   ".into()),
            filter: Some(Map::new()),
        });
        assert!(action.scoped_query().is_none());

        let action = Action::new(ActionKind::Open).with_query(ActionQuery {
            text: Some("linen shirt".into()),
            filter: None,
        });
        assert!(action.scoped_query().is_some());
    }

    #[test_timeout::timeout]
    fn query_matches_filter_and_text() {
        let mut fields = Map::new();
        fields.insert("product_id".into(), Value::String("p1".into()));
        fields.insert("category".into(), Value::String("shoes".into()));
        fields.insert("title".into(), Value::String("Leather Sandals".into()));

        let mut filter = Map::new();
        filter.insert("category".into(), Value::String("shoes".into()));
        let by_filter = ActionQuery {
            text: None,
            filter: Some(filter.clone()),
        };
        assert!(by_filter.matches(&fields));

        let both = ActionQuery {
            text: Some("sandals".into()),
            filter: Some(filter),
        };
        assert!(both.matches(&fields));

        let wrong_text = ActionQuery {
            text: Some("boots".into()),
            filter: None,
        };
        assert!(!wrong_text.matches(&fields));

        let mut other = Map::new();
        other.insert("category".into(), Value::String("hats".into()));
        let wrong_filter = ActionQuery {
            text: None,
            filter: Some(other),
        };
        assert!(!wrong_filter.matches(&fields));
    }
}
