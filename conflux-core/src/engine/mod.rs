//! Scheduler / Propagator
//!
//! The engine owns the network arena and drives it to quiescence. It keeps
//! three queues:
//!
//! 1. **updates** — pending value writes (external inputs and returned
//!    command completions)
//! 2. **propagate** — connections whose source has advanced
//! 3. **ready** — instances whose firing predicate is satisfied
//!
//! One turn of the main loop drains them in that order. Queue order is
//! FIFO; instances ready in the same turn fire in creation order, so a
//! given sequence of external writes always replays to the same result
//! regardless of wall-clock scheduling.
//!
//! Callbacks run off the mutation lock: the turn collects the fire batch
//! under the lock, releases it, runs the callbacks on scoped worker
//! threads, then reintegrates each staged [`RunOutput`] under the lock in
//! creation order. An instance is never re-entered while its staged output
//! awaits integration.
//!
//! External submissions land in a separate inbound queue guarded by its
//! own small lock, so a command dispatcher invoked during integration may
//! deliver a completion without deadlocking against the engine lock.

pub mod command;
mod load;

pub use command::{
    Command, CommandDispatcher, CommandId, CommandStatus, Completion, DispatchedCommand,
    NullDispatcher,
};
pub use load::LoadEvent;

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::func::{Callback, FunctionRegistry, NewConnection, NewInstance, RunInput, RunOutput};
use crate::net::{
    ConnId, Endpoint, FiringState, InstanceId, InstanceStatus, NetworkArena, NetworkId,
};
use crate::path::{Direction, Path, Steps};
use crate::persist::{self, InstanceSnapshot, Snapshot};
use crate::value::{Value, Version};

/// An inbound mutation: an external write or a returned command.
#[derive(Debug, Clone)]
pub enum Update {
    Write { target: Path, value: Value },
    Completed(Completion),
}

/// Fold the external-boundary directions onto the trees they alias, for
/// queue bookkeeping.
fn canon(direction: Direction) -> Direction {
    match direction {
        Direction::ExtIn => Direction::In,
        Direction::ExtOut => Direction::Out,
        other => other,
    }
}

struct FireJob {
    instance: InstanceId,
    callback: Arc<dyn Callback>,
    input: RunInput,
}

struct FireResult {
    instance: InstanceId,
    output: RunOutput,
}

/// Everything guarded by the engine's mutation lock.
struct EngineState {
    arena: NetworkArena,
    root: NetworkId,
    clock: Version,
    updates: VecDeque<Update>,
    propagate: VecDeque<ConnId>,
    ready: VecDeque<InstanceId>,
    /// Outstanding commands by raw id.
    pending: indexmap::IndexMap<u64, (InstanceId, DispatchedCommand)>,
    next_cmd: u64,
    shutting_down: bool,
}

/// The per-project scheduler.
pub struct Engine {
    funcs: Arc<FunctionRegistry>,
    dispatcher: Arc<dyn CommandDispatcher>,
    base_dir: PathBuf,
    state: Mutex<EngineState>,
    /// Thread-safe inbound queue; the only lock external callers take.
    inbound: Mutex<VecDeque<Update>>,
    wake: Condvar,
}

impl Engine {
    /// Create an engine with an empty root network. Freezes the function
    /// registry: the activation phase begins here.
    pub fn new(
        mut funcs: FunctionRegistry,
        dispatcher: Arc<dyn CommandDispatcher>,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        funcs.freeze();
        let mut arena = NetworkArena::new();
        let root = arena.add_network(None);
        Self {
            funcs: Arc::new(funcs),
            dispatcher,
            base_dir: base_dir.into(),
            state: Mutex::new(EngineState {
                arena,
                root,
                clock: Version::ZERO,
                updates: VecDeque::new(),
                propagate: VecDeque::new(),
                ready: VecDeque::new(),
                pending: indexmap::IndexMap::new(),
                next_cmd: 1,
                shutting_down: false,
            }),
            inbound: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
        }
    }

    // ------------------------------------------------------------------
    // Structure edits
    // ------------------------------------------------------------------

    /// Create an instance of a registered function in the root network.
    pub fn add_instance(&self, name: &str, function: &str) -> Result<()> {
        let def = self.funcs.lookup(function)?;
        let mut state = self.state.lock();
        let root = state.root;
        let id = state.arena.add_instance(root, name, def, &self.base_dir)?;
        std::fs::create_dir_all(state.arena.instance(id).persistent_dir())?;
        Ok(())
    }

    /// Connect two root-network subvalues, e.g. `a:out.sum` -> `b:in.x`.
    pub fn connect(&self, src: &str, dst: &str) -> Result<()> {
        let src: Path = src.parse()?;
        let dst: Path = dst.parse()?;
        let mut state = self.state.lock();
        let (src_inst, src_dir, src_steps) = resolve_abs(&state.arena, state.root, &src)?;
        let (dst_inst, dst_dir, dst_steps) = resolve_abs(&state.arena, state.root, &dst)?;
        let net = state.arena.instance(src_inst).network;
        let conn = state.arena.add_connection(
            net,
            Endpoint::new(src_inst, src_dir, src_steps),
            Endpoint::new(dst_inst, dst_dir, dst_steps),
        )?;
        // Pick up anything the source already holds.
        state.propagate.push_back(conn);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound events
    // ------------------------------------------------------------------

    /// Queue an external write, e.g. `a:in.x` = 2. Applied on the next
    /// turn of the main loop.
    pub fn write(&self, path: &str, value: Value) -> Result<()> {
        let target: Path = path.parse()?;
        if target.direction.is_none() {
            return Err(Error::PathParse(
                path.to_string(),
                "write target needs a direction".to_string(),
            ));
        }
        self.inbound
            .lock()
            .push_back(Update::Write { target, value });
        self.wake.notify_all();
        Ok(())
    }

    /// Deliver a command completion from the external collaborator.
    pub fn complete_command(&self, completion: Completion) {
        self.inbound.lock().push_back(Update::Completed(completion));
        self.wake.notify_all();
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    /// Run turns until every queue is empty. Returns with the network
    /// quiescent: no instance `Ready` or `Running`.
    pub fn run_until_quiescent(&self) -> Result<()> {
        loop {
            let jobs = {
                let mut state = self.state.lock();
                self.drain_inbound(&mut state);
                self.apply_updates(&mut state)?;
                self.propagate_all(&mut state)?;
                let jobs = self.collect_fires(&mut state);
                if jobs.is_empty()
                    && state.updates.is_empty()
                    && state.propagate.is_empty()
                    && state.ready.is_empty()
                    && self.inbound.lock().is_empty()
                {
                    return Ok(());
                }
                jobs
            };

            if !jobs.is_empty() {
                let results = run_callbacks(jobs);
                let mut state = self.state.lock();
                for result in results {
                    self.integrate_fire(&mut state, result)?;
                }
            }
        }
    }

    /// Serve the engine until shutdown: run to quiescence, then suspend
    /// until new input, a command completion, or the shutdown signal.
    pub fn run(&self) -> Result<()> {
        loop {
            if self.state.lock().shutting_down {
                return Ok(());
            }
            self.run_until_quiescent()?;
            let mut inbox = self.inbound.lock();
            if inbox.is_empty() {
                let _ = self.wake.wait_for(&mut inbox, Duration::from_millis(50));
            }
        }
    }

    /// Signal shutdown: discard queued fires and propagations, await
    /// outstanding commands up to `deadline`, integrating their
    /// completions, then return. Callers checkpoint afterwards.
    pub fn shutdown(&self, deadline: Duration) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
            state.ready.clear();
            state.propagate.clear();
        }
        let end = Instant::now() + deadline;
        loop {
            self.run_until_quiescent()?;
            if self.state.lock().pending.is_empty() {
                return Ok(());
            }
            let mut inbox = self.inbound.lock();
            if inbox.is_empty() && self.wake.wait_until(&mut inbox, end).timed_out() {
                tracing::warn!("shutdown deadline passed with commands outstanding");
                return Ok(());
            }
        }
    }

    /// Whether every queue is empty and nothing is ready or running.
    pub fn quiescent(&self) -> bool {
        if !self.inbound.lock().is_empty() {
            return false;
        }
        let state = self.state.lock();
        state.updates.is_empty()
            && state.propagate.is_empty()
            && state.ready.is_empty()
            && state
                .arena
                .instances()
                .all(|i| !matches!(i.state(), FiringState::Ready | FiringState::Running))
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// The status triple of an instance. Nested instances are addressed by
    /// canonical name, e.g. `tune/grompp_0`.
    pub fn status(&self, name: &str) -> Result<InstanceStatus> {
        let state = self.state.lock();
        let id = find_by_canonical(&state.arena, state.root, name)?;
        Ok(state.arena.instance(id).status())
    }

    /// A clone of the subvalue a path addresses.
    pub fn value(&self, path: &str) -> Result<Value> {
        let path: Path = path.parse()?;
        let state = self.state.lock();
        let (inst, dir, steps) = resolve_abs(&state.arena, state.root, &path)?;
        Ok(state.arena.instance(inst).tree(dir)?.get(&steps)?.clone())
    }

    /// The engine's logical clock, for quiescence-idempotence checks.
    pub fn clock(&self) -> Version {
        self.state.lock().clock
    }

    /// Cancel one instance: mark it `Done` with a cancellation error and
    /// abort its outstanding commands through the collaborator.
    pub fn cancel_instance(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let id = find_by_canonical(&state.arena, state.root, name)?;
        let drained = state.arena.instance_mut(id).cancel();
        for cmd_id in drained {
            state.pending.shift_remove(&cmd_id.0);
            self.dispatcher.cancel(cmd_id)?;
        }
        Ok(())
    }

    /// Dry-run an instance's callback against its current inputs with the
    /// testing flag set, discarding all staged output. Used to validate a
    /// project before activating it.
    pub fn dry_run(&self, name: &str) -> Result<()> {
        let (callback, input) = {
            let state = self.state.lock();
            let id = find_by_canonical(&state.arena, state.root, name)?;
            let inst = state.arena.instance(id);
            let input = RunInput {
                testing: true,
                inputs: inst.tree(Direction::In)?.clone(),
                sub_inputs: inst.tree(Direction::SubIn).ok().cloned(),
                cmd: None,
                persistent_dir: inst.persistent_dir().to_path_buf(),
                last_fired: Version::ZERO,
            };
            (inst.definition().callback().clone(), input)
        };
        let mut out = RunOutput::new();
        callback.fire(&input, &mut out)?;
        match out.error {
            Some(msg) => Err(Error::Callback(msg)),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Capture the whole network as a snapshot document.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        Snapshot {
            clock: state.clock,
            root: state.root,
            networks: state.arena.networks().cloned().collect(),
            instances: state
                .arena
                .instances()
                .map(InstanceSnapshot::from_instance)
                .collect(),
            connections: state.arena.connections().cloned().collect(),
            pending: state.pending.values().cloned().collect(),
            next_cmd: state.next_cmd,
        }
    }

    /// Write a checkpoint to disk. Retries transient failures with
    /// backoff.
    pub fn checkpoint(&self, path: &FsPath) -> Result<()> {
        let snap = self.snapshot();
        persist::write_snapshot(path, &snap)?;
        tracing::info!(path = %path.display(), "checkpoint written");
        Ok(())
    }

    /// Rebuild an engine from a checkpoint. In-flight commands recorded in
    /// the snapshot are reissued from their last recorded parameters.
    /// Restore failures are fatal.
    pub fn restore(
        mut funcs: FunctionRegistry,
        dispatcher: Arc<dyn CommandDispatcher>,
        base_dir: impl Into<PathBuf>,
        path: &FsPath,
    ) -> Result<Self> {
        let snap = persist::read_snapshot(path)?;
        funcs.freeze();
        let funcs = Arc::new(funcs);

        let mut arena = NetworkArena::new();
        snap.restore_arena(&funcs, &mut arena)?;

        let mut pending = indexmap::IndexMap::new();
        for (inst, cmd) in &snap.pending {
            pending.insert(cmd.id.0, (*inst, cmd.clone()));
        }

        let engine = Self {
            funcs,
            dispatcher,
            base_dir: base_dir.into(),
            state: Mutex::new(EngineState {
                arena,
                root: snap.root,
                clock: snap.clock,
                updates: VecDeque::new(),
                propagate: VecDeque::new(),
                ready: VecDeque::new(),
                pending,
                next_cmd: snap.next_cmd,
                shutting_down: false,
            }),
            inbound: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
        };

        // Reissue whatever was still in flight at checkpoint time.
        {
            let state = engine.state.lock();
            for (_, cmd) in state.pending.values() {
                tracing::info!(id = cmd.id.0, key = %cmd.command.key, "reissuing command");
                engine.dispatcher.dispatch(cmd)?;
            }
        }
        Ok(engine)
    }

    // ------------------------------------------------------------------
    // Turn internals
    // ------------------------------------------------------------------

    fn drain_inbound(&self, state: &mut EngineState) {
        let mut inbox = self.inbound.lock();
        state.updates.extend(inbox.drain(..));
    }

    /// Step 1: apply one batch of queued writes and completions.
    fn apply_updates(&self, state: &mut EngineState) -> Result<()> {
        let batch = std::mem::take(&mut state.updates);
        for update in batch {
            match update {
                Update::Write { target, value } => {
                    let (inst, dir, steps) = resolve_abs(&state.arena, state.root, &target)?;
                    let version = state.clock.next();
                    state.clock = version;
                    let changed = state
                        .arena
                        .instance_mut(inst)
                        .write(dir, &steps, &value, version)?;
                    tracing::debug!(path = %target, %version, changed, "external write");
                    if changed {
                        self.after_tree_change(state, inst, canon(dir));
                    }
                }
                Update::Completed(completion) => {
                    let Some((inst, _)) = state.pending.shift_remove(&completion.id.0) else {
                        tracing::warn!(id = completion.id.0, "completion for unknown command");
                        continue;
                    };
                    if completion.status == CommandStatus::Failed {
                        let diagnostics =
                            completion.diagnostics.clone().unwrap_or_default();
                        tracing::warn!(
                            id = completion.id.0,
                            diagnostics = diagnostics.as_str(),
                            "command failed"
                        );
                        state.arena.instance_mut(inst).last_warning =
                            Some(Error::CommandFailed(completion.id.0, diagnostics).to_string());
                    }
                    let instance = state.arena.instance_mut(inst);
                    if instance.complete_command(completion) {
                        push_ready(state, inst);
                    }
                }
            }
        }
        Ok(())
    }

    /// Step 2: copy deltas across every queued connection.
    fn propagate_all(&self, state: &mut EngineState) -> Result<()> {
        // Destinations written this turn, for the fan-in diagnostic.
        let mut writers: HashMap<(InstanceId, Direction, Steps), ConnId> = HashMap::new();
        while let Some(conn_id) = state.propagate.pop_front() {
            let conn = state.arena.connection(conn_id).clone();
            if !conn.active {
                continue;
            }
            let src_inst = state.arena.instance(conn.source.instance);
            let Some(src_sub) = src_inst.tree(conn.source.direction)?.lookup(&conn.source.steps)
            else {
                continue;
            };
            let src_version = src_sub.version();
            if src_version <= conn.last_propagated {
                continue;
            }
            let delta = src_sub.clone();

            let version = state.clock.next();
            state.clock = version;
            let changed = state
                .arena
                .instance_mut(conn.dest.instance)
                .tree_mut(conn.dest.direction)?
                .merge_at(&conn.dest.steps, &delta, conn.last_propagated, version)?;
            state.arena.connection_mut(conn_id).last_propagated = src_version;
            tracing::debug!(conn = conn_id.0, %version, changed, "propagated");

            if changed {
                let key = (
                    conn.dest.instance,
                    canon(conn.dest.direction),
                    conn.dest.steps.clone(),
                );
                if let Some(prev) = writers.insert(key, conn_id) {
                    if prev != conn_id {
                        // Last writer wins; flag the contest.
                        tracing::warn!(
                            dest = %conn.dest.describe(state.arena.instance(conn.dest.instance).name()),
                            "contested fan-in: multiple sources wrote this subvalue in one turn"
                        );
                    }
                }
                self.after_tree_change(state, conn.dest.instance, canon(conn.dest.direction));
            }
        }
        Ok(())
    }

    /// Step 3: take the ready batch, in creation order, and move each
    /// instance to `Running` with an input snapshot.
    fn collect_fires(&self, state: &mut EngineState) -> Vec<FireJob> {
        if state.shutting_down {
            state.ready.clear();
            return Vec::new();
        }
        let mut ids: Vec<InstanceId> = state.ready.drain(..).collect();
        ids.retain(|id| state.arena.instance(*id).state() == FiringState::Ready);
        ids.sort_by_key(|id| state.arena.instance(*id).created);

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let version = state.clock.next();
            state.clock = version;
            let inst = state.arena.instance_mut(id);
            let input = RunInput {
                testing: false,
                inputs: inst.inputs.clone(),
                sub_inputs: inst.sub_inputs.clone(),
                cmd: inst.inbox.pop_front(),
                persistent_dir: inst.persistent_dir().to_path_buf(),
                last_fired: inst.last_fired,
            };
            inst.begin_fire(version);
            tracing::debug!(instance = inst.name(), %version, "firing");
            jobs.push(FireJob {
                instance: id,
                callback: inst.definition().callback().clone(),
                input,
            });
        }
        jobs
    }

    /// Apply one fire's staged output under the lock.
    fn integrate_fire(&self, state: &mut EngineState, result: FireResult) -> Result<()> {
        let FireResult { instance, output } = result;
        if let Some(msg) = &output.error {
            tracing::error!(
                instance = state.arena.instance(instance).name(),
                error = msg.as_str(),
                "callback error; discarding staged output"
            );
            state.arena.instance_mut(instance).mark_error(msg.clone());
        } else if let Err(err) = self.apply_staging(state, instance, output) {
            state.arena.instance_mut(instance).mark_error(err.to_string());
        } else {
            let inst = state.arena.instance_mut(instance);
            if inst.state() == FiringState::Running {
                inst.state = FiringState::Done;
            }
        }

        // Input that arrived while the callback ran may re-arm it.
        if state.arena.instance_mut(instance).refresh_ready() {
            push_ready(state, instance);
        }
        Ok(())
    }

    /// Apply a staged [`RunOutput`] all-or-nothing: every tree write is
    /// type-checked and every structural edit either lands or is rolled
    /// back before the first output value becomes visible. A rejected
    /// staging therefore leaves the network exactly as the fire found it.
    fn apply_staging(
        &self,
        state: &mut EngineState,
        instance: InstanceId,
        output: RunOutput,
    ) -> Result<()> {
        let RunOutput {
            outs,
            sub_outs,
            instances,
            connections,
            commands,
            cancel_prev,
            error: _,
            warnings,
        } = output;

        if let Some(last) = warnings.last() {
            tracing::warn!(
                instance = state.arena.instance(instance).name(),
                warning = last.as_str(),
                "callback warning"
            );
            state.arena.instance_mut(instance).last_warning = Some(last.clone());
        }

        // Validate the output writes before touching any tree.
        {
            let inst = state.arena.instance(instance);
            for (steps, value) in &outs {
                inst.tree(Direction::Out)?.check_set(steps, value)?;
            }
            for (steps, value) in &sub_outs {
                inst.tree(Direction::SubOut)?.check_set(steps, value)?;
            }
        }

        // Structural edits under a watermark; constant injections and
        // propagation pushes are deferred until the batch has held up.
        let mark = state.arena.mark();
        let mut new_conns: Vec<ConnId> = Vec::new();
        let mut const_writes: Vec<(InstanceId, Direction, Steps, Value)> = Vec::new();
        if let Err(err) = self.stage_structural(
            state,
            instance,
            instances,
            connections,
            &mut new_conns,
            &mut const_writes,
        ) {
            state.arena.rollback(mark);
            return Err(err);
        }

        for (steps, value) in outs {
            let version = state.clock.next();
            state.clock = version;
            let changed =
                state
                    .arena
                    .instance_mut(instance)
                    .write(Direction::Out, &steps, &value, version)?;
            if changed {
                self.after_tree_change(state, instance, Direction::Out);
            }
        }
        for (steps, value) in sub_outs {
            let version = state.clock.next();
            state.clock = version;
            let changed = state.arena.instance_mut(instance).write(
                Direction::SubOut,
                &steps,
                &value,
                version,
            )?;
            if changed {
                self.after_tree_change(state, instance, Direction::SubOut);
            }
        }
        for (dst_inst, dst_dir, dst_steps, value) in const_writes {
            let version = state.clock.next();
            state.clock = version;
            let changed =
                state
                    .arena
                    .instance_mut(dst_inst)
                    .write(dst_dir, &dst_steps, &value, version)?;
            if changed {
                self.after_tree_change(state, dst_inst, canon(dst_dir));
            }
        }
        for conn in new_conns {
            state.propagate.push_back(conn);
        }

        // Command lifecycle.
        if cancel_prev {
            let drained =
                std::mem::take(&mut state.arena.instance_mut(instance).outstanding);
            for cmd_id in drained {
                state.pending.shift_remove(&cmd_id.0);
                self.dispatcher.cancel(cmd_id)?;
            }
        }
        for command in commands {
            let id = CommandId(state.next_cmd);
            state.next_cmd += 1;
            let dispatched = DispatchedCommand {
                id,
                instance: state.arena.canonical_name(instance),
                command,
                persistent_dir: state.arena.instance(instance).persistent_dir().to_path_buf(),
            };
            state.pending.insert(id.0, (instance, dispatched.clone()));
            state.arena.instance_mut(instance).add_outstanding(id);
            self.dispatcher.dispatch(&dispatched)?;
            tracing::debug!(id = id.0, key = %dispatched.command.key, "command dispatched");
        }
        Ok(())
    }

    /// The structural half of a staging: sub-network creation, new
    /// instances, and declared connections. Constant injections are only
    /// validated here and handed back for the write phase. On error the
    /// caller rolls the arena back to its watermark.
    fn stage_structural(
        &self,
        state: &mut EngineState,
        instance: InstanceId,
        instances: Vec<NewInstance>,
        connections: Vec<NewConnection>,
        new_conns: &mut Vec<ConnId>,
        const_writes: &mut Vec<(InstanceId, Direction, Steps, Value)>,
    ) -> Result<()> {
        if instances.is_empty() && connections.is_empty() {
            return Ok(());
        }
        let subnet = match state.arena.instance(instance).subnet() {
            Some(net) => net,
            None => state.arena.add_network(Some(instance)),
        };
        for new in instances {
            let def = self.funcs.lookup(&new.function)?;
            let id = state
                .arena
                .add_instance(subnet, &new.name, def, &self.base_dir)?;
            std::fs::create_dir_all(state.arena.instance(id).persistent_dir())?;
        }
        for NewConnection { src, dst, value } in connections {
            let (dst_inst, dst_dir, dst_steps) =
                state.arena.resolve(subnet, Some(instance), &dst)?;
            match src {
                Some(src) => {
                    let (src_inst, src_dir, src_steps) =
                        state.arena.resolve(subnet, Some(instance), &src)?;
                    let conn = state.arena.add_connection(
                        subnet,
                        Endpoint::new(src_inst, src_dir, src_steps),
                        Endpoint::new(dst_inst, dst_dir, dst_steps),
                    )?;
                    new_conns.push(conn);
                }
                None => {
                    // Constant injection.
                    let value = value.ok_or_else(|| {
                        Error::PathParse(
                            dst.to_string(),
                            "constant connection needs a value".to_string(),
                        )
                    })?;
                    state
                        .arena
                        .instance(dst_inst)
                        .tree(dst_dir)?
                        .check_set(&dst_steps, &value)?;
                    const_writes.push((dst_inst, dst_dir, dst_steps, value));
                }
            }
        }
        Ok(())
    }

    /// After a tree changed: queue the instance's outgoing connections on
    /// that tree and refresh readiness for input-side changes.
    fn after_tree_change(&self, state: &mut EngineState, instance: InstanceId, tree: Direction) {
        let outgoing: Vec<ConnId> = state
            .arena
            .instance(instance)
            .outgoing
            .iter()
            .copied()
            .filter(|id| {
                let conn = state.arena.connection(*id);
                conn.active && canon(conn.source.direction) == tree
            })
            .collect();
        for conn in outgoing {
            if !state.propagate.contains(&conn) {
                state.propagate.push_back(conn);
            }
        }

        if tree.is_input() && state.arena.instance_mut(instance).refresh_ready() {
            push_ready(state, instance);
        }
    }
}

fn push_ready(state: &mut EngineState, id: InstanceId) {
    if !state.ready.contains(&id) {
        state.ready.push_back(id);
    }
}

/// Resolve a path whose instance segment may be a canonical name
/// (`parent/child`), walking sub-networks from the root.
fn resolve_abs(
    arena: &NetworkArena,
    root: NetworkId,
    path: &Path,
) -> Result<(InstanceId, Direction, Steps)> {
    let id = find_by_canonical(arena, root, &path.instance)?;
    let direction = path.direction.ok_or_else(|| {
        Error::PathParse(path.to_string(), "target needs a direction".to_string())
    })?;
    Ok((id, direction, path.steps.clone()))
}

fn find_by_canonical(arena: &NetworkArena, root: NetworkId, name: &str) -> Result<InstanceId> {
    let mut net = root;
    let mut current = None;
    for segment in name.split('/') {
        if let Some(inst) = current {
            net = arena
                .instance(inst)
                .subnet()
                .ok_or_else(|| Error::UnknownInstance(name.to_string()))?;
        }
        current = Some(arena.find_instance(net, segment)?);
    }
    current.ok_or_else(|| Error::UnknownInstance(name.to_string()))
}

/// Run a fire batch off the engine lock. A single job runs inline; larger
/// batches fan out to scoped worker threads. Results come back in batch
/// order either way, so integration order stays deterministic.
fn run_callbacks(jobs: Vec<FireJob>) -> Vec<FireResult> {
    fn run_one(job: FireJob) -> FireResult {
        let FireJob {
            instance,
            callback,
            input,
        } = job;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut out = RunOutput::new();
            let result = callback.fire(&input, &mut out);
            (result, out)
        }));
        let output = match outcome {
            Ok((Ok(()), out)) => out,
            Ok((Err(err), mut out)) => {
                if out.error.is_none() {
                    out.set_error(err.to_string());
                }
                out
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "callback panicked".to_string());
                let mut out = RunOutput::new();
                out.set_error(msg);
                out
            }
        };
        FireResult { instance, output }
    }

    if jobs.len() == 1 {
        return jobs.into_iter().map(run_one).collect();
    }
    std::thread::scope(|scope| {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let id = job.instance;
                (id, scope.spawn(move || run_one(job)))
            })
            .collect();
        handles
            .into_iter()
            .map(|(id, handle)| {
                handle.join().unwrap_or_else(|_| {
                    let mut out = RunOutput::new();
                    out.set_error("worker thread panicked");
                    FireResult {
                        instance: id,
                        output: out,
                    }
                })
            })
            .collect()
    })
}
