//! REST route tables per collaborator service.
//!
//! A profile maps operation names onto concrete HTTP routes. Path templates
//! use `{field}` placeholders filled from the operation payload; whether the
//! remaining payload travels as a JSON body or as query parameters is part of
//! the route. Profiles shape requests only, they never validate business
//! fields.

use std::collections::HashMap;

/// How the opaque payload is attached to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadAs {
    Json,
    Query,
    None,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub method: &'static str,
    pub path: &'static str,
    pub send: PayloadAs,
}

#[derive(Debug, Clone)]
pub struct RestProfile {
    routes: HashMap<&'static str, Route>,
}

impl RestProfile {
    fn new(entries: &[(&'static str, &'static str, &'static str, PayloadAs)]) -> Self {
        let mut routes = HashMap::new();
        for (op, method, path, send) in entries {
            routes.insert(
                *op,
                Route {
                    method,
                    path,
                    send: *send,
                },
            );
        }
        Self { routes }
    }

    pub fn route(&self, operation: &str) -> Option<&Route> {
        self.routes.get(operation)
    }

    pub fn supports(&self, operation: &str) -> bool {
        self.routes.contains_key(operation)
    }

    pub fn operations(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.keys().copied()
    }

    /// Built-in profile for a known service id, if there is one.
    pub fn for_service(id: &str) -> Option<RestProfile> {
        match id {
            "jira" => Some(Self::jira()),
            "confluence" => Some(Self::confluence()),
            "github" => Some(Self::github()),
            "slack" => Some(Self::slack()),
            "cloudability" => Some(Self::cloudability()),
            _ => None,
        }
    }

    pub fn jira() -> RestProfile {
        use PayloadAs::*;
        Self::new(&[
            ("create_issue", "POST", "/rest/api/3/issue", Json),
            ("get_issue", "GET", "/rest/api/3/issue/{key}", None),
            ("search_issues", "GET", "/rest/api/3/search", Query),
            ("add_comment", "POST", "/rest/api/3/issue/{key}/comment", Json),
            (
                "transition_issue",
                "POST",
                "/rest/api/3/issue/{key}/transitions",
                Json,
            ),
        ])
    }

    pub fn confluence() -> RestProfile {
        use PayloadAs::*;
        Self::new(&[
            ("create_page", "POST", "/wiki/rest/api/content", Json),
            ("get_page", "GET", "/wiki/rest/api/content/{id}", None),
            ("update_page", "PUT", "/wiki/rest/api/content/{id}", Json),
            ("search_content", "GET", "/wiki/rest/api/content/search", Query),
        ])
    }

    pub fn github() -> RestProfile {
        use PayloadAs::*;
        Self::new(&[
            ("create_issue", "POST", "/repos/{owner}/{repo}/issues", Json),
            ("list_issues", "GET", "/repos/{owner}/{repo}/issues", Query),
            (
                "add_comment",
                "POST",
                "/repos/{owner}/{repo}/issues/{number}/comments",
                Json,
            ),
            ("create_pull", "POST", "/repos/{owner}/{repo}/pulls", Json),
            ("get_repo", "GET", "/repos/{owner}/{repo}", None),
        ])
    }

    pub fn slack() -> RestProfile {
        use PayloadAs::*;
        Self::new(&[
            ("post_message", "POST", "/api/chat.postMessage", Json),
            ("list_channels", "GET", "/api/conversations.list", Query),
            ("lookup_user", "GET", "/api/users.lookupByEmail", Query),
        ])
    }

    pub fn cloudability() -> RestProfile {
        use PayloadAs::*;
        Self::new(&[
            ("get_cost_report", "GET", "/v3/reporting/cost/run", Query),
            ("list_views", "GET", "/v3/views", None),
            ("get_view", "GET", "/v3/views/{id}", None),
            ("get_budgets", "GET", "/v3/budgets", Query),
            ("list_anomalies", "GET", "/v3/anomalies", Query),
            ("get_forecast", "GET", "/v3/forecast", Query),
        ])
    }
}
