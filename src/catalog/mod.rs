//! The project catalog.
//!
//! A [`Project`] has exactly one coordinator, fixed at creation, a set of participants and an
//! ordered list of tasks. Membership and tasks can only change under the conditions enforced by
//! the coordination service, which holds the project lock while checking the project's runs.

pub mod tasks;

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::info;

pub use self::tasks::{normalize_tasks, validate_tasks, TaskSpec};
use crate::{
    common::{ProjectId, RunId, SiteId},
    error::{CoordinationError, CoordinationResult},
    registry::SiteRegistry,
    storage::{RowGuard, Table},
};

/// A named collection of ordered tasks with one coordinator and a participant set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub description: String,
    pub coordinator: SiteId,
    pub participants: BTreeSet<SiteId>,
    pub tasks: Vec<TaskSpec>,
    /// All the runs of the project, oldest first.
    pub runs: Vec<RunId>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Returns whether the site coordinates or participates in the project.
    pub fn involves(&self, site: SiteId) -> bool {
        self.coordinator == site || self.participants.contains(&site)
    }

    pub(crate) fn add_participant(&mut self, site: SiteId) -> CoordinationResult<()> {
        if site == self.coordinator {
            return Err(CoordinationError::conflict(format!(
                "site {} coordinates project {} and cannot join it as a participant",
                site, self.id
            )));
        }
        if !self.participants.insert(site) {
            return Err(CoordinationError::conflict(format!(
                "site {} already participates in project {}",
                site, self.id
            )));
        }
        Ok(())
    }

    pub(crate) fn remove_participant(&mut self, site: SiteId) -> CoordinationResult<()> {
        if self.participants.remove(&site) {
            Ok(())
        } else {
            Err(CoordinationError::validation(format!(
                "site {} is not a participant of project {}",
                site, self.id
            )))
        }
    }
}

/// The parameters of a project creation.
#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub coordinator: SiteId,
    #[serde(default)]
    pub participants: Vec<SiteId>,
    pub tasks: Vec<TaskSpec>,
}

/// The catalog of all the projects.
#[derive(Debug, Default)]
pub struct ProjectCatalog {
    projects: Table<ProjectId, Project>,
    names: Mutex<HashMap<String, ProjectId>>,
    /// The model kinds tasks may use. Empty means any.
    allowed_models: Vec<String>,
}

impl ProjectCatalog {
    pub fn new(allowed_models: Vec<String>) -> Self {
        Self {
            allowed_models,
            ..Self::default()
        }
    }

    /// Creates a project.
    ///
    /// # Errors
    /// - validation errors for a blank name, an invalid task list or a participant list that
    ///   contains the coordinator or duplicates;
    /// - unknown site if the coordinator or a participant is unknown, or a participant is
    ///   deregistered;
    /// - authorization error if the coordinator is deregistered;
    /// - conflict if the name is taken.
    pub async fn create(
        &self,
        registry: &SiteRegistry,
        new: NewProject,
    ) -> CoordinationResult<Project> {
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(CoordinationError::validation(
                "project name must not be empty",
            ));
        }
        let tasks = self.check_tasks(new.tasks)?;

        let mut participants = BTreeSet::new();
        for site in new.participants.iter().copied() {
            if site == new.coordinator {
                return Err(CoordinationError::validation(
                    "the coordinator cannot be a participant of its own project",
                ));
            }
            if !participants.insert(site) {
                return Err(CoordinationError::validation(format!(
                    "participant {} is listed twice",
                    site
                )));
            }
        }

        let coordinator = registry.site(new.coordinator).await?;
        if coordinator.is_deregistered() {
            return Err(CoordinationError::authorization(format!(
                "deregistered site {} cannot coordinate a project",
                coordinator.id
            )));
        }
        for site in participants.iter().copied() {
            registry.live_site(site).await?;
        }

        let mut names = self.names.lock().await;
        if names.contains_key(&name) {
            return Err(CoordinationError::conflict(format!(
                "a project named {} already exists",
                name
            )));
        }
        let project = Project {
            id: ProjectId::new(),
            name: name.clone(),
            description: new.description,
            coordinator: coordinator.id,
            participants,
            tasks,
            runs: Vec::new(),
            created_at: Utc::now(),
        };
        self.projects.insert(project.id, project.clone()).await;
        names.insert(name, project.id);

        info!(
            project_id = %project.id,
            coordinator = %project.coordinator,
            tasks = project.tasks.len(),
            "project created"
        );
        Ok(project)
    }

    /// Normalizes a task list and checks it against the catalog's rules.
    pub fn check_tasks(&self, tasks: Vec<TaskSpec>) -> CoordinationResult<Vec<TaskSpec>> {
        let tasks = normalize_tasks(tasks);
        validate_tasks(&tasks, &self.allowed_models)?;
        Ok(tasks)
    }

    /// Locks a project for a read-modify-write cycle.
    pub async fn lock(&self, id: ProjectId) -> CoordinationResult<RowGuard<Project>> {
        self.projects
            .lock(&id)
            .await
            .ok_or(CoordinationError::UnknownProject(id))
    }

    pub async fn project(&self, id: ProjectId) -> CoordinationResult<Project> {
        self.projects
            .get(&id)
            .await
            .ok_or(CoordinationError::UnknownProject(id))
    }

    pub async fn by_name(&self, name: &str) -> CoordinationResult<Project> {
        let id = self
            .names
            .lock()
            .await
            .get(name.trim())
            .copied()
            .ok_or_else(|| CoordinationError::UnknownProjectName(name.to_string()))?;
        self.project(id).await
    }

    /// Returns the ids of all the projects.
    pub async fn ids(&self) -> Vec<ProjectId> {
        self.projects.keys().await
    }

    /// Returns every project the site coordinates or participates in, oldest first.
    pub async fn projects_of(&self, site: SiteId) -> Vec<Project> {
        let mut projects = Vec::new();
        for id in self.ids().await {
            if let Some(project) = self.projects.get(&id).await {
                if project.involves(site) {
                    projects.push(project);
                }
            }
        }
        projects.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        projects
    }
}

#[cfg(test)]
mod tests {
    use super::{tasks::tests::tasks, *};

    async fn setup() -> (SiteRegistry, SiteId, SiteId) {
        let registry = SiteRegistry::new();
        let h1 = registry.register("H1", "", "uid-1").await.unwrap().id;
        let h2 = registry.register("H2", "", "uid-2").await.unwrap().id;
        (registry, h1, h2)
    }

    fn new_project(name: &str, coordinator: SiteId, participants: Vec<SiteId>) -> NewProject {
        NewProject {
            name: name.to_string(),
            description: String::new(),
            coordinator,
            participants,
            tasks: tasks(2),
        }
    }

    #[tokio::test]
    async fn test_create() {
        let (registry, h1, h2) = setup().await;
        let catalog = ProjectCatalog::default();
        let project = catalog
            .create(&registry, new_project("P", h1, vec![h2]))
            .await
            .unwrap();
        assert_eq!(project.coordinator, h1);
        assert!(project.participants.contains(&h2));
        assert_eq!(catalog.project(project.id).await.unwrap(), project);
        assert_eq!(catalog.by_name("P").await.unwrap().id, project.id);
    }

    #[tokio::test]
    async fn test_create_rejects_coordinator_as_participant() {
        let (registry, h1, h2) = setup().await;
        let catalog = ProjectCatalog::default();
        let err = catalog
            .create(&registry, new_project("P", h1, vec![h2, h1]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(_)));

        let err = catalog
            .create(&registry, new_project("P", h1, vec![h2, h2]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_with_unknown_sites() {
        let (registry, h1, _) = setup().await;
        let catalog = ProjectCatalog::default();
        let stranger = SiteId::new();

        let err = catalog
            .create(&registry, new_project("P", h1, vec![stranger]))
            .await
            .unwrap_err();
        assert_eq!(err, CoordinationError::UnknownSite(stranger));

        let err = catalog
            .create(&registry, new_project("P", stranger, vec![]))
            .await
            .unwrap_err();
        assert_eq!(err, CoordinationError::UnknownSite(stranger));
    }

    #[tokio::test]
    async fn test_create_with_deregistered_coordinator() {
        let (registry, h1, h2) = setup().await;
        registry.deregister(h1).await.unwrap();
        let catalog = ProjectCatalog::default();
        let err = catalog
            .create(&registry, new_project("P", h1, vec![h2]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Authorization(_)));
    }

    #[tokio::test]
    async fn test_create_with_unreachable_coordinator() {
        let (registry, h1, h2) = setup().await;
        registry.mark_unreachable(h1).await.unwrap();
        let catalog = ProjectCatalog::default();
        assert!(catalog
            .create(&registry, new_project("P", h1, vec![h2]))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_create_duplicate_name() {
        let (registry, h1, h2) = setup().await;
        let catalog = ProjectCatalog::default();
        catalog
            .create(&registry, new_project("P", h1, vec![h2]))
            .await
            .unwrap();
        let err = catalog
            .create(&registry, new_project(" P ", h2, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_create_with_invalid_tasks() {
        let (registry, h1, h2) = setup().await;
        let catalog = ProjectCatalog::new(vec!["SVM".to_string()]);
        let err = catalog
            .create(&registry, new_project("P", h1, vec![h2]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(_)));
        assert!(catalog.ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_stores_trimmed_models() {
        let (registry, h1, h2) = setup().await;
        let catalog = ProjectCatalog::new(vec!["LogisticRegression".to_string()]);
        let mut new = new_project("P", h1, vec![h2]);
        new.tasks[0].model = "  LogisticRegression ".to_string();
        let project = catalog.create(&registry, new).await.unwrap();
        assert_eq!(project.tasks[0].model, "LogisticRegression");
        assert_eq!(
            catalog.project(project.id).await.unwrap().tasks[0].model,
            "LogisticRegression"
        );
    }

    #[tokio::test]
    async fn test_membership() {
        let (registry, h1, h2) = setup().await;
        let catalog = ProjectCatalog::default();
        let project = catalog
            .create(&registry, new_project("P", h1, vec![]))
            .await
            .unwrap();

        let mut project = catalog.lock(project.id).await.unwrap();
        project.add_participant(h2).unwrap();
        assert!(matches!(
            project.add_participant(h2),
            Err(CoordinationError::Conflict(_))
        ));
        assert!(matches!(
            project.add_participant(h1),
            Err(CoordinationError::Conflict(_))
        ));
        project.remove_participant(h2).unwrap();
        assert!(matches!(
            project.remove_participant(h2),
            Err(CoordinationError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_projects_of() {
        let (registry, h1, h2) = setup().await;
        let h3 = registry.register("H3", "", "uid-3").await.unwrap().id;
        let catalog = ProjectCatalog::default();
        let p = catalog
            .create(&registry, new_project("P", h1, vec![h2]))
            .await
            .unwrap();
        let q = catalog
            .create(&registry, new_project("Q", h2, vec![]))
            .await
            .unwrap();

        let of_h2: Vec<_> = catalog.projects_of(h2).await.into_iter().map(|p| p.id).collect();
        assert_eq!(of_h2, vec![p.id, q.id]);
        assert_eq!(catalog.projects_of(h1).await.len(), 1);
        assert!(catalog.projects_of(h3).await.is_empty());
    }
}
