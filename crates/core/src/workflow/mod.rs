pub mod dag;
pub mod template;

pub use dag::Dag;
pub use template::{TemplateEdge, TemplateGraph, TemplateNode};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::types::{
    DefaultParameters, JobId, JobStatus, ParamValue, Parameters, WorkflowId, WorkflowRecord,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet, VecDeque};

/// Handle to one workflow: a DAG of jobs built in construction mode and then
/// submitted as a unit. Only root membership and parent→child edges are
/// persisted; the graph is rebuilt by traversal when needed.
#[derive(Clone)]
pub struct Workflow {
    engine: Engine,
    id: WorkflowId,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow").field("id", &self.id).finish()
    }
}

impl Workflow {
    pub(crate) fn from_id(engine: Engine, id: WorkflowId) -> Self {
        Self { engine, id }
    }

    fn create(engine: &Engine, owner: &str, name: Option<&str>) -> Result<Workflow> {
        let record = WorkflowRecord {
            id: WorkflowId::new(),
            owner: owner.to_string(),
            name: name
                .map(str::to_string)
                .unwrap_or_else(|| format!("{owner}'s workflow")),
            created_at: Utc::now(),
        };
        engine.store.insert_workflow(&record)?;
        tracing::info!(workflow_id = %record.id, "created workflow");
        Ok(Workflow::from_id(engine.clone(), record.id))
    }

    /// Start a workflow from a single concrete root job.
    pub fn from_scratch(
        engine: &Engine,
        owner: &str,
        parameters: Parameters,
        name: Option<&str>,
    ) -> Result<Workflow> {
        let workflow = Self::create(engine, owner, name)?;
        let root = Job::create(engine, owner, parameters)?;
        engine.store.add_root(&workflow.id, &root.id())?;
        Ok(workflow)
    }

    /// Instantiate a template: one job per node, created parents-first, with
    /// every edge connection wired as a deferred parameter.
    ///
    /// `required_params` must cover exactly the template's root nodes; those
    /// are the only jobs that need concrete inputs up front.
    pub fn from_template(
        engine: &Engine,
        owner: &str,
        template: &TemplateGraph,
        required_params: &BTreeMap<String, BTreeMap<String, ParamValue>>,
        name: Option<&str>,
    ) -> Result<Workflow> {
        if template.nodes.is_empty() {
            return Err(Error::validation("template has no nodes"));
        }
        let node_dag = template.dag()?;
        let order = node_dag.topological_order()?;

        let root_names: HashSet<&String> = template
            .nodes
            .keys()
            .filter(|name| node_dag.in_degree(*name) == 0)
            .collect();
        let provided: HashSet<&String> = required_params.keys().collect();
        if root_names != provided {
            let mut missing: Vec<&str> = root_names
                .difference(&provided)
                .map(|s| s.as_str())
                .collect();
            missing.sort_unstable();
            let mut extra: Vec<&str> = provided
                .difference(&root_names)
                .map(|s| s.as_str())
                .collect();
            extra.sort_unstable();

            let mut message = String::from(
                "provided required parameters do not match the initial set of \
                 commands for the workflow.",
            );
            if !missing.is_empty() {
                message.push_str(&format!(
                    " Command(s) \"{}\" are missing the required parameter set.",
                    missing.join(", ")
                ));
            }
            if !extra.is_empty() {
                message.push_str(&format!(
                    " Parameters for command(s) \"{}\" have been provided, but they \
                     are not the initial commands for the workflow.",
                    extra.join(", ")
                ));
            }
            return Err(Error::validation(message));
        }

        let workflow = Self::create(engine, owner, name)?;
        let mut jobs: BTreeMap<String, JobId> = BTreeMap::new();
        for node_name in order {
            let node = template.node(&node_name)?;
            let mut parameters = Parameters::from_defaults(
                &node.default_params,
                required_params.get(&node_name),
                None,
            );
            let incoming = template.incoming(&node_name);
            for edge in &incoming {
                let producer = jobs[&edge.source];
                for (output, param) in &edge.connections {
                    parameters.values.insert(
                        param.clone(),
                        ParamValue::Deferred {
                            producer,
                            output: output.clone(),
                        },
                    );
                }
            }

            let job = Job::create(engine, owner, parameters)?;
            if incoming.is_empty() {
                engine.store.add_root(&workflow.id, &job.id())?;
            } else {
                for edge in &incoming {
                    engine.store.add_edge(&jobs[&edge.source], &job.id())?;
                }
            }
            jobs.insert(node_name, job.id());
        }

        Ok(workflow)
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    fn record(&self) -> Result<WorkflowRecord> {
        self.engine.store.workflow(&self.id)
    }

    pub fn name(&self) -> Result<String> {
        Ok(self.record()?.name)
    }

    pub fn owner(&self) -> Result<String> {
        Ok(self.record()?.owner)
    }

    pub fn root_jobs(&self) -> Result<Vec<Job>> {
        Ok(self
            .engine
            .store
            .root_ids(&self.id)?
            .into_iter()
            .map(|id| self.engine.job(id))
            .collect())
    }

    /// Rebuild the job DAG by walking parent→child edges from the roots.
    pub fn graph(&self) -> Result<Dag<JobId>> {
        let mut graph = Dag::new();
        let roots = self.engine.store.root_ids(&self.id)?;
        let mut seen: HashSet<JobId> = roots.iter().copied().collect();
        let mut queue: VecDeque<JobId> = VecDeque::new();
        for root in roots {
            graph.add_node(root);
            queue.push_back(root);
        }
        while let Some(id) = queue.pop_front() {
            for child in self.engine.store.children_ids(&id)? {
                graph.add_edge(id, child);
                if seen.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        Ok(graph)
    }

    /// The graph can only be changed while every root is `in_construction`;
    /// after submission its shape is frozen.
    fn raise_if_not_in_construction(&self) -> Result<()> {
        let roots = self.engine.store.root_ids(&self.id)?;
        if roots.is_empty() {
            return Err(Error::not_permitted("workflow is not in construction"));
        }
        for root in roots {
            if self.engine.store.job(&root)?.status != JobStatus::InConstruction {
                return Err(Error::not_permitted("workflow is not in construction"));
            }
        }
        Ok(())
    }

    /// Add a job to the workflow under construction. With `connections` the
    /// job hangs off existing jobs, its connected parameters deferred; without
    /// them it becomes another root and needs concrete values.
    pub fn add(
        &self,
        default_params: &DefaultParameters,
        connections: Option<&BTreeMap<JobId, BTreeMap<String, String>>>,
        required_params: Option<&BTreeMap<String, ParamValue>>,
        optional_params: Option<&BTreeMap<String, ParamValue>>,
    ) -> Result<Job> {
        self.raise_if_not_in_construction()?;

        let mut parameters =
            Parameters::from_defaults(default_params, required_params, optional_params);
        if let Some(connections) = connections {
            let graph = self.graph()?;
            for producer in connections.keys() {
                if !graph.contains(producer) {
                    return Err(Error::validation(format!(
                        "job '{producer}' is not part of this workflow"
                    )));
                }
            }
            for (producer, wiring) in connections {
                for (output, param) in wiring {
                    parameters.values.insert(
                        param.clone(),
                        ParamValue::Deferred {
                            producer: *producer,
                            output: output.clone(),
                        },
                    );
                }
            }

            let job = Job::create(&self.engine, &self.record()?.owner, parameters)?;
            for producer in connections.keys() {
                self.engine.store.add_edge(producer, &job.id())?;
            }
            Ok(job)
        } else {
            let job = Job::create(&self.engine, &self.record()?.owner, parameters)?;
            self.engine.store.add_root(&self.id, &job.id())?;
            Ok(job)
        }
    }

    /// Remove a job from the workflow under construction. A job with children
    /// can only be removed with `cascade`, which takes all of its descendants
    /// with it.
    pub fn remove(&self, job: JobId, cascade: bool) -> Result<()> {
        self.raise_if_not_in_construction()?;

        let graph = self.graph()?;
        if !graph.contains(&job) {
            return Err(Error::validation(format!(
                "job '{job}' is not part of this workflow"
            )));
        }
        if !cascade && !graph.children(&job).is_empty() {
            return Err(Error::not_permitted(format!(
                "can't remove job '{job}': it has children"
            )));
        }

        let mut doomed: HashSet<JobId> = HashSet::from([job]);
        if cascade {
            doomed.extend(graph.descendants(&job));
        }
        // children first, so no surviving edge ever points at a deleted job
        let order: Vec<JobId> = graph
            .topological_order()?
            .into_iter()
            .filter(|id| doomed.contains(id))
            .rev()
            .collect();
        for id in order {
            self.engine.store.remove_incoming_edges(&id)?;
            self.engine.store.remove_root(&self.id, &id)?;
            self.engine.store.remove_inputs(&id)?;
            self.engine.store.delete_job(&id)?;
        }
        Ok(())
    }

    /// Submit the workflow: every non-root job is parked in `waiting` before
    /// any root is handed to the launcher, so a root that finishes instantly
    /// always finds its dependents in a submittable state.
    pub async fn submit(&self) -> Result<()> {
        self.raise_if_not_in_construction()?;

        let graph = self.graph()?;
        let roots: HashSet<JobId> = self.engine.store.root_ids(&self.id)?.into_iter().collect();
        for node in graph.nodes() {
            if !roots.contains(node) {
                self.engine.store.transition(node, JobStatus::Waiting)?;
            }
        }

        tracing::info!(workflow_id = %self.id, jobs = graph.len(), "submitting workflow");
        for root in &roots {
            self.engine.job(*root).submit().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{artifact, data, scalar, settle, Harness};
    use crate::types::ArtifactId;

    fn import_defaults() -> DefaultParameters {
        DefaultParameters::new(
            "import-sequences",
            [("template".to_string(), scalar("mapping.txt"))].into(),
        )
    }

    fn otus_defaults() -> DefaultParameters {
        DefaultParameters::new(
            "pick-otus",
            [("similarity".to_string(), scalar(0.97))].into(),
        )
    }

    fn merge_defaults() -> DefaultParameters {
        DefaultParameters::new("merge-tables", BTreeMap::new())
    }

    /// root (import-sequences) → child (pick-otus via "imported" → "input")
    fn pipeline(h: &Harness) -> (Workflow, Job, Job) {
        let workflow = Workflow::from_scratch(
            &h.engine,
            "demo@example.com",
            Parameters::new(
                "import-sequences",
                [("template".to_string(), scalar("mapping.txt"))].into(),
            ),
            None,
        )
        .unwrap();
        let root = workflow.root_jobs().unwrap().remove(0);
        let connections: BTreeMap<_, _> = [(
            root.id(),
            [("imported".to_string(), "input".to_string())].into(),
        )]
        .into();
        let child = workflow
            .add(&otus_defaults(), Some(&connections), None, None)
            .unwrap();
        (workflow, root, child)
    }

    #[tokio::test]
    async fn from_scratch_creates_named_root() {
        let h = Harness::new();
        let workflow = Workflow::from_scratch(
            &h.engine,
            "demo@example.com",
            Parameters::new(
                "import-sequences",
                [("template".to_string(), scalar("mapping.txt"))].into(),
            ),
            None,
        )
        .unwrap();

        assert_eq!(workflow.name().unwrap(), "demo@example.com's workflow");
        assert_eq!(workflow.owner().unwrap(), "demo@example.com");
        let roots = workflow.root_jobs().unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].status().unwrap(), JobStatus::InConstruction);
        assert_eq!(roots[0].command().unwrap(), "import-sequences");
    }

    #[tokio::test]
    async fn add_wires_deferred_parameters() {
        let h = Harness::new();
        let (workflow, root, child) = pipeline(&h);

        let pending = child.pending().unwrap();
        assert_eq!(pending[&root.id()]["input"], "imported");

        let graph = workflow.graph().unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.roots(), vec![root.id()]);
        assert_eq!(graph.children(&root.id()), vec![child.id()]);
    }

    #[tokio::test]
    async fn add_rejects_foreign_producer() {
        let h = Harness::new();
        let (workflow, _root, _child) = pipeline(&h);

        let connections: BTreeMap<_, _> = [(
            JobId::new(),
            [("imported".to_string(), "input".to_string())].into(),
        )]
        .into();
        let err = workflow
            .add(&otus_defaults(), Some(&connections), None, None)
            .unwrap_err();
        assert!(err.to_string().contains("is not part of this workflow"));
    }

    #[tokio::test]
    async fn submit_parks_dependents_before_roots() {
        let h = Harness::new();
        let (workflow, root, child) = pipeline(&h);

        workflow.submit().await.unwrap();
        assert_eq!(root.status().unwrap(), JobStatus::Queued);
        assert_eq!(child.status().unwrap(), JobStatus::Waiting);

        settle().await;
        let launched = h.launcher.launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].job_id, root.id());
    }

    #[tokio::test]
    async fn completion_resolves_and_submits_child() {
        let h = Harness::new();
        let (workflow, root, child) = pipeline(&h);
        workflow.submit().await.unwrap();

        root.update_heartbeat_state().unwrap();
        root.complete(true, Some(data("imported")), None).await.unwrap();

        assert_eq!(root.status().unwrap(), JobStatus::Success);
        assert_eq!(child.status().unwrap(), JobStatus::Queued);
        assert!(child.pending().unwrap().is_empty());

        let produced = root.output_artifacts().unwrap()["imported"];
        assert_eq!(
            child.parameters().unwrap().values["input"],
            ParamValue::Artifact { id: produced }
        );
        assert_eq!(child.input_artifacts().unwrap(), vec![produced]);

        settle().await;
        let launched = h.launcher.launched();
        assert_eq!(launched.len(), 2);
        assert_eq!(launched[1].job_id, child.id());
    }

    #[tokio::test]
    async fn failure_cascades_to_descendants() {
        let h = Harness::new();
        let (workflow, root, child) = pipeline(&h);
        workflow.submit().await.unwrap();

        root.update_heartbeat_state().unwrap();
        root.complete(false, None, Some("boom")).await.unwrap();

        assert_eq!(root.status().unwrap(), JobStatus::Error);
        assert_eq!(root.log().unwrap().unwrap().message, "boom");

        assert_eq!(child.status().unwrap(), JobStatus::Error);
        assert_eq!(
            child.log().unwrap().unwrap().message,
            format!("Parent job '{}' failed.", root.id())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_parents_resolve_without_losing_updates() {
        let h = Harness::new();
        let workflow = Workflow::from_scratch(
            &h.engine,
            "demo@example.com",
            Parameters::new(
                "import-sequences",
                [("template".to_string(), scalar("left.txt"))].into(),
            ),
            None,
        )
        .unwrap();
        let left = workflow.root_jobs().unwrap().remove(0);
        let right = workflow
            .add(
                &import_defaults(),
                None,
                Some(&[("template".to_string(), scalar("right.txt"))].into()),
                None,
            )
            .unwrap();

        let connections: BTreeMap<_, _> = [
            (
                left.id(),
                [("imported".to_string(), "left".to_string())].into(),
            ),
            (
                right.id(),
                [("imported".to_string(), "right".to_string())].into(),
            ),
        ]
        .into();
        let merge = workflow
            .add(&merge_defaults(), Some(&connections), None, None)
            .unwrap();

        workflow.submit().await.unwrap();
        left.update_heartbeat_state().unwrap();
        right.update_heartbeat_state().unwrap();

        let (a, b) = tokio::join!(
            left.complete(true, Some(data("imported")), None),
            right.complete(true, Some(data("imported")), None),
        );
        a.unwrap();
        b.unwrap();

        // both deferred slots resolved; the merge job was submitted exactly
        // when the second parent finished
        assert!(merge.pending().unwrap().is_empty());
        assert_eq!(merge.status().unwrap(), JobStatus::Queued);
        let values = merge.parameters().unwrap().values;
        assert!(matches!(values["left"], ParamValue::Artifact { .. }));
        assert!(matches!(values["right"], ParamValue::Artifact { .. }));
    }

    #[tokio::test]
    async fn mutation_rejected_after_submission() {
        let h = Harness::new();
        let (workflow, root, child) = pipeline(&h);
        workflow.submit().await.unwrap();

        let err = workflow
            .add(&import_defaults(), None, None, None)
            .unwrap_err();
        assert!(err.to_string().contains("not in construction"));
        let err = workflow.remove(child.id(), false).unwrap_err();
        assert!(err.to_string().contains("not in construction"));
        let err = workflow.submit().await.unwrap_err();
        assert!(err.to_string().contains("not in construction"));
        let _ = root;
    }

    #[tokio::test]
    async fn remove_requires_cascade_for_parents() {
        let h = Harness::new();
        let (workflow, root, child) = pipeline(&h);

        let err = workflow.remove(root.id(), false).unwrap_err();
        assert!(err.to_string().contains("it has children"));

        workflow.remove(child.id(), false).unwrap();
        assert!(!child.exists().unwrap());
        assert_eq!(workflow.graph().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_cascade_deletes_descendants() {
        let h = Harness::new();
        let (workflow, root, child) = pipeline(&h);
        let connections: BTreeMap<_, _> = [(
            child.id(),
            [("otu-table".to_string(), "input".to_string())].into(),
        )]
        .into();
        let grandchild = workflow
            .add(&otus_defaults(), Some(&connections), None, None)
            .unwrap();

        workflow.remove(child.id(), true).unwrap();
        assert!(!child.exists().unwrap());
        assert!(!grandchild.exists().unwrap());
        assert!(root.exists().unwrap());
        assert!(root.children().unwrap().is_empty());
        assert_eq!(workflow.graph().unwrap().len(), 1);
    }

    fn demux_otus_template() -> TemplateGraph {
        TemplateGraph {
            nodes: [
                (
                    "demux".to_string(),
                    TemplateNode {
                        command: "split-libraries".to_string(),
                        default_params: DefaultParameters::new(
                            "split-libraries",
                            [("barcode-type".to_string(), scalar("golay"))].into(),
                        ),
                    },
                ),
                (
                    "otus".to_string(),
                    TemplateNode {
                        command: "pick-otus".to_string(),
                        default_params: otus_defaults(),
                    },
                ),
            ]
            .into(),
            edges: vec![TemplateEdge {
                source: "demux".to_string(),
                target: "otus".to_string(),
                connections: [("demultiplexed".to_string(), "input".to_string())].into(),
            }],
        }
    }

    #[tokio::test]
    async fn from_template_instantiates_jobs() {
        let h = Harness::new();
        let input = ArtifactId::new();
        let required: BTreeMap<_, _> = [(
            "demux".to_string(),
            BTreeMap::from([("input".to_string(), artifact(input))]),
        )]
        .into();

        let workflow = Workflow::from_template(
            &h.engine,
            "demo@example.com",
            &demux_otus_template(),
            &required,
            Some("demux and otus"),
        )
        .unwrap();
        assert_eq!(workflow.name().unwrap(), "demux and otus");

        let roots = workflow.root_jobs().unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].command().unwrap(), "split-libraries");
        assert_eq!(roots[0].input_artifacts().unwrap(), vec![input]);

        let children = roots[0].children().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].command().unwrap(), "pick-otus");
        let pending = children[0].pending().unwrap();
        assert_eq!(pending[&roots[0].id()]["input"], "demultiplexed");
    }

    #[tokio::test]
    async fn from_template_rejects_mismatched_required_params() {
        let h = Harness::new();
        let required: BTreeMap<_, _> = [(
            "otus".to_string(),
            BTreeMap::from([("input".to_string(), artifact(ArtifactId::new()))]),
        )]
        .into();

        let err = Workflow::from_template(
            &h.engine,
            "demo@example.com",
            &demux_otus_template(),
            &required,
            None,
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("do not match the initial set of commands"));
        assert!(message.contains("Command(s) \"demux\" are missing"));
        assert!(message.contains("\"otus\" have been provided"));
    }

    #[tokio::test]
    async fn from_template_rejects_empty_template() {
        let h = Harness::new();
        let template = TemplateGraph {
            nodes: BTreeMap::new(),
            edges: Vec::new(),
        };
        let err = Workflow::from_template(
            &h.engine,
            "demo@example.com",
            &template,
            &BTreeMap::new(),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("template has no nodes"));
    }
}
