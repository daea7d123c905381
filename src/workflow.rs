use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Warning;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Explore,
    Plan,
    General,
    Build,
    Review,
    /// Clearly linked sub-session whose name matches no known pattern.
    Agent,
}

const AGENT_PATTERNS: &[(&str, AgentKind)] = &[
    ("explore", AgentKind::Explore),
    ("search", AgentKind::Explore),
    ("research", AgentKind::Explore),
    ("plan", AgentKind::Plan),
    ("architect", AgentKind::Plan),
    ("general", AgentKind::General),
    ("build", AgentKind::Build),
    ("code", AgentKind::Build),
    ("review", AgentKind::Review),
];

impl AgentKind {
    pub fn from_name(name: &str) -> Self {
        let lower = name.trim().to_ascii_lowercase();
        AGENT_PATTERNS
            .iter()
            .find(|(pattern, _)| lower.contains(pattern))
            .map(|(_, kind)| *kind)
            .unwrap_or(Self::Agent)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Explore => "explore",
            Self::Plan => "plan",
            Self::General => "general",
            Self::Build => "build",
            Self::Review => "review",
            Self::Agent => "agent",
        }
    }
}

/// How a session ended up attached to its workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentLink {
    Root,
    Declared,
    Inferred,
    Orphaned,
    CycleBroken,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowMember {
    pub session: Session,
    pub agent: Option<AgentKind>,
    pub depth: usize,
    pub link: ParentLink,
}

/// A root session and every session whose parent chain resolves to it.
/// Metrics are derived from the members on demand.
#[derive(Debug, Clone, Serialize)]
pub struct Workflow {
    pub root: WorkflowMember,
    pub sub_agents: Vec<WorkflowMember>,
}

impl Workflow {
    pub fn id(&self) -> &str {
        &self.root.session.session_id
    }

    pub fn members(&self) -> impl Iterator<Item = &WorkflowMember> {
        std::iter::once(&self.root).chain(self.sub_agents.iter())
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.members().map(|member| &member.session)
    }

    pub fn size(&self) -> usize {
        1 + self.sub_agents.len()
    }

    pub fn sub_agent_count(&self) -> usize {
        self.sub_agents.len()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.sessions().filter_map(Session::start_time).min()
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.sessions().filter_map(Session::end_time).max()
    }

    /// Earliest session anchor; falls back to file times for untimed sessions.
    pub fn anchor_time(&self) -> Option<DateTime<Utc>> {
        self.start_time()
            .or_else(|| self.sessions().filter_map(|session| session.file_modified).min())
    }

    pub fn display_title(&self) -> String {
        self.root.session.display_title()
    }

    pub fn project_name(&self) -> &str {
        &self.root.session.project_name
    }

    pub fn agent_kinds(&self) -> Vec<AgentKind> {
        let mut kinds: Vec<AgentKind> = self.sub_agents.iter().filter_map(|m| m.agent).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupingOptions {
    /// When false every session is its own workflow.
    pub link_parents: bool,
    pub infer_parents: bool,
}

impl Default for GroupingOptions {
    fn default() -> Self {
        Self {
            link_parents: true,
            infer_parents: true,
        }
    }
}

impl GroupingOptions {
    pub fn new(group_workflows: bool, infer_parents: bool) -> Self {
        Self {
            link_parents: group_workflows,
            infer_parents,
        }
    }

    pub fn flat() -> Self {
        Self {
            link_parents: false,
            infer_parents: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct GroupOutcome {
    pub workflows: Vec<Workflow>,
    pub warnings: Vec<Warning>,
}

impl GroupOutcome {
    pub fn session_count(&self) -> usize {
        self.workflows.iter().map(Workflow::size).sum()
    }
}

/// Extracts the agent name from a `... (@explore subagent)` title marker.
pub fn subagent_marker(title: &str) -> Option<&str> {
    let start = title.rfind("(@")? + 2;
    let rest = &title[start..];
    let end = rest.find(" subagent)")?;
    let name = rest[..end].trim();
    (!name.is_empty()).then_some(name)
}

fn agent_kind_for(session: &Session) -> Option<AgentKind> {
    let marker = session.title.as_deref().and_then(subagent_marker);
    if session.parent_id.is_none() && marker.is_none() {
        return None;
    }
    let name = session.agent_name.as_deref().or(marker).unwrap_or_default();
    Some(AgentKind::from_name(name))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    Visiting,
    Done,
}

/// Partitions `sessions` into workflows. Every session lands in exactly one
/// workflow; unresolvable parents and cycles degrade to extra roots and are
/// reported as warnings.
pub fn group_sessions(mut sessions: Vec<Session>, options: GroupingOptions) -> GroupOutcome {
    sessions.sort_by(|left, right| {
        (left.start_time(), &left.session_id).cmp(&(right.start_time(), &right.session_id))
    });

    let mut warnings = Vec::new();
    let count = sessions.len();
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(count);
    for (idx, session) in sessions.iter().enumerate() {
        index.entry(session.session_id.as_str()).or_insert(idx);
    }

    let mut parents: Vec<Option<usize>> = vec![None; count];
    let mut links: Vec<ParentLink> = vec![ParentLink::Root; count];
    if options.link_parents {
        for (idx, session) in sessions.iter().enumerate() {
            if let Some(parent_id) = session.parent_id.as_deref() {
                match index.get(parent_id) {
                    Some(&parent) => {
                        parents[idx] = Some(parent);
                        links[idx] = ParentLink::Declared;
                    }
                    None => {
                        tracing::warn!(session = %session.session_id, parent = %parent_id, "sub-agent parent not found");
                        links[idx] = ParentLink::Orphaned;
                        warnings.push(Warning::OrphanAgent {
                            session_id: session.session_id.clone(),
                            parent_id: parent_id.to_string(),
                        });
                    }
                }
            } else if options.infer_parents
                && let Some(parent) = infer_parent(&sessions, idx)
            {
                parents[idx] = Some(parent);
                links[idx] = ParentLink::Inferred;
            }
        }
    }

    let mut state = vec![VisitState::Unvisited; count];
    let mut roots: Vec<usize> = (0..count).collect();
    let mut depths: Vec<usize> = vec![0; count];
    let mut path: Vec<usize> = Vec::new();

    for start in 0..count {
        if state[start] == VisitState::Done {
            continue;
        }
        path.clear();
        let mut cursor = start;
        loop {
            match state[cursor] {
                VisitState::Done => break,
                VisitState::Visiting => {
                    let from = path.iter().position(|node| *node == cursor).unwrap_or(0);
                    let cycle: Vec<String> = path[from..]
                        .iter()
                        .map(|node| sessions[*node].session_id.clone())
                        .collect();
                    if let Some(&closing) = path.last() {
                        parents[closing] = None;
                        links[closing] = ParentLink::CycleBroken;
                    }
                    tracing::warn!(sessions = %cycle.join(" -> "), "parent cycle detected");
                    warnings.push(Warning::CycleDetected { session_ids: cycle });
                    break;
                }
                VisitState::Unvisited => {
                    state[cursor] = VisitState::Visiting;
                    path.push(cursor);
                    match parents[cursor] {
                        Some(parent) => cursor = parent,
                        None => break,
                    }
                }
            }
        }

        for &node in path.iter().rev() {
            match parents[node] {
                Some(parent) => {
                    roots[node] = roots[parent];
                    depths[node] = depths[parent] + 1;
                }
                None => {
                    roots[node] = node;
                    depths[node] = 0;
                }
            }
            state[node] = VisitState::Done;
        }
    }

    let mut slots: HashMap<usize, usize> = HashMap::new();
    let mut partial: Vec<(Option<WorkflowMember>, Vec<WorkflowMember>)> = Vec::new();
    for node in 0..count {
        if roots[node] == node {
            slots.insert(node, partial.len());
            partial.push((None, Vec::new()));
        }
    }

    for (idx, session) in sessions.into_iter().enumerate() {
        let member = WorkflowMember {
            agent: agent_kind_for(&session),
            session,
            depth: depths[idx],
            link: links[idx],
        };
        let Some(&slot) = slots.get(&roots[idx]) else {
            continue;
        };
        if roots[idx] == idx {
            partial[slot].0 = Some(member);
        } else {
            partial[slot].1.push(member);
        }
    }

    let workflows = partial
        .into_iter()
        .filter_map(|(root, sub_agents)| root.map(|root| Workflow { root, sub_agents }))
        .collect();
    GroupOutcome {
        workflows,
        warnings,
    }
}

/// Best-effort parent for a session whose title carries a sub-agent marker
/// but no declared parent: the single root session of the same project whose
/// span covers the child's start.
fn infer_parent(sessions: &[Session], child_idx: usize) -> Option<usize> {
    let child = &sessions[child_idx];
    child.title.as_deref().and_then(subagent_marker)?;
    let project = child.project_path.as_ref()?;
    let child_start = child.start_time()?;

    let mut candidates = sessions.iter().enumerate().filter(|(idx, candidate)| {
        *idx != child_idx
            && candidate.parent_id.is_none()
            && candidate
                .title
                .as_deref()
                .and_then(subagent_marker)
                .is_none()
            && candidate.project_path.as_ref() == Some(project)
            && candidate.start_time().is_some_and(|start| start <= child_start)
            && candidate.end_time().is_some_and(|end| end >= child_start)
    });
    let (first, _) = candidates.next()?;
    if candidates.next().is_some() {
        return None;
    }
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn session(id: &str, parent: Option<&str>, start_min: i64) -> Session {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 9, 0, 0)
            .single()
            .expect("valid time")
            + chrono::Duration::minutes(start_min);
        Session {
            session_id: id.to_string(),
            title: None,
            project_path: Some(PathBuf::from("/work/app")),
            project_name: "app".to_string(),
            parent_id: parent.map(str::to_string),
            agent_name: None,
            created_at: Some(start),
            updated_at: Some(start + chrono::Duration::minutes(30)),
            interactions: Vec::new(),
            source_file: PathBuf::from(format!("{id}.jsonl")),
            file_modified: None,
        }
    }

    fn workflow_of<'a>(outcome: &'a GroupOutcome, id: &str) -> &'a Workflow {
        outcome
            .workflows
            .iter()
            .find(|workflow| workflow.sessions().any(|s| s.session_id == id))
            .expect("session grouped")
    }

    #[test]
    fn declared_children_join_parent_workflow() {
        let mut explore = session("child", Some("root"), 5);
        explore.agent_name = Some("explore".to_string());
        let outcome = group_sessions(
            vec![explore, session("root", None, 0), session("other", None, 60)],
            GroupingOptions::default(),
        );

        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.workflows.len(), 2);
        let workflow = workflow_of(&outcome, "child");
        assert_eq!(workflow.id(), "root");
        assert_eq!(workflow.size(), 2);
        assert_eq!(workflow.sub_agents[0].agent, Some(AgentKind::Explore));
        assert_eq!(workflow.sub_agents[0].link, ParentLink::Declared);
        assert_eq!(workflow.root.agent, None);
    }

    #[test]
    fn missing_parent_becomes_singleton_root() {
        let outcome = group_sessions(
            vec![session("lonely", Some("ghost"), 0)],
            GroupingOptions::default(),
        );
        assert_eq!(outcome.workflows.len(), 1);
        assert_eq!(outcome.workflows[0].root.link, ParentLink::Orphaned);
        assert_eq!(outcome.workflows[0].root.agent, Some(AgentKind::Agent));
        assert_eq!(
            outcome.warnings,
            vec![Warning::OrphanAgent {
                session_id: "lonely".to_string(),
                parent_id: "ghost".to_string(),
            }]
        );
    }

    #[test]
    fn two_session_cycle_is_broken_once() {
        let outcome = group_sessions(
            vec![session("a", Some("b"), 0), session("b", Some("a"), 1)],
            GroupingOptions::default(),
        );
        assert_eq!(outcome.session_count(), 2);
        assert_eq!(outcome.workflows.len(), 1);
        let cycles: Vec<&Warning> = outcome
            .warnings
            .iter()
            .filter(|w| matches!(w, Warning::CycleDetected { .. }))
            .collect();
        assert_eq!(cycles.len(), 1);
        assert_eq!(outcome.workflows[0].id(), "b");
        assert_eq!(outcome.workflows[0].root.link, ParentLink::CycleBroken);
    }

    #[test]
    fn self_parent_is_a_cycle() {
        let outcome = group_sessions(vec![session("me", Some("me"), 0)], GroupingOptions::default());
        assert_eq!(outcome.workflows.len(), 1);
        assert_eq!(
            outcome.warnings,
            vec![Warning::CycleDetected {
                session_ids: vec!["me".to_string()],
            }]
        );
    }

    #[test]
    fn nested_sub_agents_track_depth() {
        let outcome = group_sessions(
            vec![
                session("grandchild", Some("child"), 10),
                session("child", Some("root"), 5),
                session("root", None, 0),
            ],
            GroupingOptions::default(),
        );
        assert_eq!(outcome.workflows.len(), 1);
        let workflow = &outcome.workflows[0];
        let depth_of = |id: &str| {
            workflow
                .members()
                .find(|m| m.session.session_id == id)
                .map(|m| m.depth)
        };
        assert_eq!(depth_of("root"), Some(0));
        assert_eq!(depth_of("child"), Some(1));
        assert_eq!(depth_of("grandchild"), Some(2));
    }

    #[test]
    fn flat_mode_uses_trivial_partition() {
        let outcome = group_sessions(
            vec![session("root", None, 0), session("child", Some("root"), 5)],
            GroupingOptions::flat(),
        );
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.workflows.len(), 2);
        assert!(outcome.workflows.iter().all(|w| w.size() == 1));
        assert_eq!(
            workflow_of(&outcome, "child").root.agent,
            Some(AgentKind::Agent)
        );
    }

    #[test]
    fn title_marker_infers_single_covering_parent() {
        let mut child = session("child", None, 5);
        child.title = Some("Find config loaders (@plan subagent)".to_string());
        let outcome = group_sessions(
            vec![session("root", None, 0), child],
            GroupingOptions::default(),
        );
        assert_eq!(outcome.workflows.len(), 1);
        let member = &outcome.workflows[0].sub_agents[0];
        assert_eq!(member.link, ParentLink::Inferred);
        assert_eq!(member.agent, Some(AgentKind::Plan));
    }

    #[test]
    fn ambiguous_inference_falls_back_to_root() {
        let mut child = session("child", None, 5);
        child.title = Some("Scan (@explore subagent)".to_string());
        let outcome = group_sessions(
            vec![session("root-a", None, 0), session("root-b", None, 1), child],
            GroupingOptions::default(),
        );
        assert_eq!(outcome.workflows.len(), 3);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn marker_parsing_and_pattern_registry() {
        assert_eq!(subagent_marker("Search (@explore subagent)"), Some("explore"));
        assert_eq!(subagent_marker("plain title"), None);
        assert_eq!(AgentKind::from_name("Code-Reviewer"), AgentKind::Build);
        assert_eq!(AgentKind::from_name("reviewer"), AgentKind::Review);
        assert_eq!(AgentKind::from_name("custom-helper"), AgentKind::Agent);
    }

    proptest! {
        #[test]
        fn every_session_lands_in_exactly_one_workflow(
            parents in proptest::collection::vec(proptest::option::of(0usize..12), 1..12)
        ) {
            let count = parents.len();
            let sessions: Vec<Session> = parents
                .iter()
                .enumerate()
                .map(|(idx, parent)| {
                    let parent_id = parent.map(|p| format!("s{p}"));
                    session(&format!("s{idx}"), parent_id.as_deref(), idx as i64)
                })
                .collect();

            let outcome = group_sessions(sessions, GroupingOptions::default());
            prop_assert_eq!(outcome.session_count(), count);

            let mut seen = HashSet::new();
            for workflow in &outcome.workflows {
                for member in workflow.members() {
                    prop_assert!(seen.insert(member.session.session_id.clone()));
                }
            }
            prop_assert_eq!(seen.len(), count);
        }
    }
}
