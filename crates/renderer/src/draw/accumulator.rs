//! Per-frame draw accumulation and compilation.

use std::collections::BTreeMap;

use ash::vk::{self, Handle};
use tracing::warn;

use super::{GpuCommand, INSTANCE_SET, MATERIAL_SET, ResolvedCommand, SCENE_SET};
use crate::device::{GpuDevice, PipelineHandles};
use crate::pipeline::RenderPipeline;
use crate::resource::BufferBinding;

/// Pipeline identity and handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedPipeline {
    /// Pipeline id.
    pub id: u64,
    /// Pipeline handles.
    pub handles: PipelineHandles,
}

impl ResolvedPipeline {
    /// Resolves `pipeline`.
    pub fn of<D: GpuDevice>(pipeline: &RenderPipeline<D>) -> Self {
        Self {
            id: pipeline.id(),
            handles: pipeline.handles(),
        }
    }
}

/// Position of a scene in the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SceneKey {
    /// Draw order of the scene.
    pub order: i32,
    /// Scene id, orders scenes of equal draw order.
    pub id: u64,
}

/// The complete state of one instanced draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstancedDraw {
    pub pipeline: ResolvedPipeline,
    pub material: vk::DescriptorSet,
    pub instance: vk::DescriptorSet,
    pub vertices: BufferBinding,
    pub indices: BufferBinding,
    pub index_type: vk::IndexType,
    pub index_count: u32,
}

impl InstancedDraw {
    fn sort_key(&self) -> [u64; 7] {
        [
            self.pipeline.id,
            self.material.as_raw(),
            self.vertices.buffer.as_raw(),
            self.vertices.offset,
            self.indices.buffer.as_raw(),
            self.indices.offset,
            self.instance.as_raw(),
        ]
    }
}

/// Counters of one compilation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompileStats {
    /// Draws emitted.
    pub draws: u32,
    /// Binds and scissor changes emitted.
    pub binds: u32,
    /// Draws dropped for missing state.
    pub skipped: u32,
}

#[derive(Default)]
struct SceneWork {
    set: vk::DescriptorSet,
    instanced: Vec<InstancedDraw>,
    batches: Vec<Vec<ResolvedCommand>>,
}

/// Draws of one frame, grouped by scene.
#[derive(Default)]
pub struct DrawAccumulator {
    scenes: BTreeMap<SceneKey, SceneWork>,
}

impl DrawAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing was accumulated.
    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    /// Adds an instanced draw to `scene`.
    pub fn add_draw(&mut self, scene: SceneKey, scene_set: vk::DescriptorSet, draw: InstancedDraw) {
        self.scene(scene, scene_set).instanced.push(draw);
    }

    /// Adds an explicit command batch to `scene`.
    pub fn add_commands(
        &mut self,
        scene: SceneKey,
        scene_set: vk::DescriptorSet,
        commands: Vec<ResolvedCommand>,
    ) {
        self.scene(scene, scene_set).batches.push(commands);
    }

    fn scene(&mut self, key: SceneKey, set: vk::DescriptorSet) -> &mut SceneWork {
        self.scenes.entry(key).or_insert_with(|| SceneWork {
            set,
            ..Default::default()
        })
    }

    /// Compiles the accumulated draws.
    ///
    /// Scenes run in ascending [`SceneKey`] order. Within a scene, instanced
    /// draws run first, sorted by pipeline, material, vertex buffer, index
    /// buffer and instance; explicit batches follow in submission order.
    /// `full_scissor` is the scissor set when the render pass began.
    pub fn compile(&mut self, full_scissor: vk::Rect2D) -> (Vec<GpuCommand>, CompileStats) {
        let mut emitter = Emitter::new(full_scissor);

        for work in self.scenes.values_mut() {
            emitter.reset();
            work.instanced.sort_by_key(InstancedDraw::sort_key);

            for draw in &work.instanced {
                let requested = RequestedState {
                    pipeline: Some(draw.pipeline),
                    material: Some(draw.material),
                    instance: Some(draw.instance),
                    vertices: Some(draw.vertices),
                    indices: Some((draw.indices, draw.index_type)),
                    scissor: None,
                };
                emitter.draw(&requested, work.set, draw.index_count, 0, 0);
            }

            for batch in &work.batches {
                emitter.reset();
                let mut requested = RequestedState::default();
                for command in batch {
                    match *command {
                        ResolvedCommand::Pipeline(pipeline) => requested.pipeline = Some(pipeline),
                        ResolvedCommand::VertexBuffer(binding) => requested.vertices = Some(binding),
                        ResolvedCommand::IndexBuffer(binding, index_type) => {
                            requested.indices = Some((binding, index_type))
                        }
                        ResolvedCommand::MaterialSet(set) => requested.material = Some(set),
                        ResolvedCommand::InstanceSet(set) => requested.instance = Some(set),
                        ResolvedCommand::Scissor(rect) => requested.scissor = Some(rect),
                        ResolvedCommand::Draw {
                            index_count,
                            first_index,
                            vertex_offset,
                        } => emitter.draw(&requested, work.set, index_count, first_index, vertex_offset),
                        ResolvedCommand::Reset => {
                            requested = RequestedState::default();
                            emitter.reset();
                        }
                    }
                }
            }
        }

        (emitter.commands, emitter.stats)
    }

    /// Drops everything accumulated.
    pub fn clear(&mut self) {
        self.scenes.clear();
    }
}

#[derive(Default)]
struct RequestedState {
    pipeline: Option<ResolvedPipeline>,
    material: Option<vk::DescriptorSet>,
    instance: Option<vk::DescriptorSet>,
    vertices: Option<BufferBinding>,
    indices: Option<(BufferBinding, vk::IndexType)>,
    scissor: Option<vk::Rect2D>,
}

#[derive(Default)]
struct BoundState {
    pipeline: Option<u64>,
    scene: Option<vk::DescriptorSet>,
    material: Option<vk::DescriptorSet>,
    instance: Option<vk::DescriptorSet>,
    vertices: Option<BufferBinding>,
    indices: Option<(BufferBinding, vk::IndexType)>,
}

struct Emitter {
    commands: Vec<GpuCommand>,
    bound: BoundState,
    // Dynamic state survives pipeline binds and resets
    scissor: vk::Rect2D,
    full_scissor: vk::Rect2D,
    stats: CompileStats,
}

impl Emitter {
    fn new(full_scissor: vk::Rect2D) -> Self {
        Self {
            commands: Vec::new(),
            bound: BoundState::default(),
            scissor: full_scissor,
            full_scissor,
            stats: CompileStats::default(),
        }
    }

    fn reset(&mut self) {
        self.bound = BoundState::default();
    }

    fn emit(&mut self, command: GpuCommand) {
        if command.is_bind() {
            self.stats.binds += 1;
        } else {
            self.stats.draws += 1;
        }
        self.commands.push(command);
    }

    fn bind_set(&mut self, layout: vk::PipelineLayout, index: u32, set: vk::DescriptorSet) {
        self.emit(GpuCommand::BindDescriptorSet { layout, index, set });
    }

    fn draw(
        &mut self,
        requested: &RequestedState,
        scene_set: vk::DescriptorSet,
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
    ) {
        let (Some(pipeline), Some(vertices), Some((indices, index_type))) =
            (requested.pipeline, requested.vertices, requested.indices)
        else {
            warn!(
                "Draw skipped: pipeline {}, vertex buffer {}, index buffer {}",
                requested.pipeline.is_some(),
                requested.vertices.is_some(),
                requested.indices.is_some()
            );
            self.stats.skipped += 1;
            return;
        };
        let layout = pipeline.handles.layout;

        if self.bound.pipeline != Some(pipeline.id) {
            self.emit(GpuCommand::BindPipeline(pipeline.handles.pipeline));
            self.bound.pipeline = Some(pipeline.id);
            // Material and instance layouts differ between pipelines
            self.bound.material = None;
            self.bound.instance = None;
        }

        if !scene_set.is_null() && self.bound.scene != Some(scene_set) {
            self.bind_set(layout, SCENE_SET, scene_set);
            self.bound.scene = Some(scene_set);
        }

        if let Some(set) = requested.material
            && !set.is_null()
            && self.bound.material != Some(set)
        {
            self.bind_set(layout, MATERIAL_SET, set);
            self.bound.material = Some(set);
        }

        if self.bound.vertices != Some(vertices) {
            self.emit(GpuCommand::BindVertexBuffer(vertices));
            self.bound.vertices = Some(vertices);
        }

        if self.bound.indices != Some((indices, index_type)) {
            self.emit(GpuCommand::BindIndexBuffer(indices, index_type));
            self.bound.indices = Some((indices, index_type));
        }

        if let Some(set) = requested.instance
            && !set.is_null()
            && self.bound.instance != Some(set)
        {
            self.bind_set(layout, INSTANCE_SET, set);
            self.bound.instance = Some(set);
        }

        let scissor = requested.scissor.unwrap_or(self.full_scissor);
        if self.scissor != scissor {
            self.emit(GpuCommand::SetScissor(scissor));
            self.scissor = scissor;
        }

        self.emit(GpuCommand::DrawIndexed {
            index_count,
            first_index,
            vertex_offset,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(id: u64) -> ResolvedPipeline {
        ResolvedPipeline {
            id,
            handles: PipelineHandles {
                pipeline: vk::Pipeline::from_raw(100 + id),
                layout: vk::PipelineLayout::from_raw(200 + id),
            },
        }
    }

    fn set(raw: u64) -> vk::DescriptorSet {
        vk::DescriptorSet::from_raw(raw)
    }

    fn binding(raw: u64) -> BufferBinding {
        BufferBinding {
            buffer: vk::Buffer::from_raw(raw),
            offset: 0,
        }
    }

    fn draw(pipeline_id: u64, material: u64, instance: u64) -> InstancedDraw {
        InstancedDraw {
            pipeline: pipeline(pipeline_id),
            material: set(material),
            instance: set(instance),
            vertices: binding(1),
            indices: binding(2),
            index_type: vk::IndexType::UINT32,
            index_count: 6,
        }
    }

    fn full() -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
        }
    }

    const SCENE: SceneKey = SceneKey { order: 0, id: 1 };

    fn count(commands: &[GpuCommand], f: impl Fn(&GpuCommand) -> bool) -> usize {
        commands.iter().filter(|c| f(c)).count()
    }

    #[test]
    fn test_shared_state_bound_once() {
        let mut acc = DrawAccumulator::new();
        acc.add_draw(SCENE, set(50), draw(1, 10, 20));
        acc.add_draw(SCENE, set(50), draw(1, 10, 21));

        let (commands, stats) = acc.compile(full());
        let layout = pipeline(1).handles.layout;
        assert_eq!(
            commands,
            vec![
                GpuCommand::BindPipeline(pipeline(1).handles.pipeline),
                GpuCommand::BindDescriptorSet {
                    layout,
                    index: SCENE_SET,
                    set: set(50)
                },
                GpuCommand::BindDescriptorSet {
                    layout,
                    index: MATERIAL_SET,
                    set: set(10)
                },
                GpuCommand::BindVertexBuffer(binding(1)),
                GpuCommand::BindIndexBuffer(binding(2), vk::IndexType::UINT32),
                GpuCommand::BindDescriptorSet {
                    layout,
                    index: INSTANCE_SET,
                    set: set(20)
                },
                GpuCommand::DrawIndexed {
                    index_count: 6,
                    first_index: 0,
                    vertex_offset: 0
                },
                GpuCommand::BindDescriptorSet {
                    layout,
                    index: INSTANCE_SET,
                    set: set(21)
                },
                GpuCommand::DrawIndexed {
                    index_count: 6,
                    first_index: 0,
                    vertex_offset: 0
                },
            ]
        );
        assert_eq!(stats.draws, 2);
        assert_eq!(stats.binds, 7);
    }

    #[test]
    fn test_interleaved_draws_sorted_by_pipeline_and_material() {
        let mut acc = DrawAccumulator::new();
        acc.add_draw(SCENE, set(50), draw(1, 10, 20));
        acc.add_draw(SCENE, set(50), draw(2, 11, 21));
        acc.add_draw(SCENE, set(50), draw(1, 12, 22));
        acc.add_draw(SCENE, set(50), draw(2, 11, 23));
        acc.add_draw(SCENE, set(50), draw(1, 10, 24));

        let (commands, stats) = acc.compile(full());
        assert_eq!(stats.draws, 5);
        assert_eq!(count(&commands, |c| matches!(c, GpuCommand::BindPipeline(_))), 2);
        assert_eq!(
            count(&commands, |c| matches!(
                c,
                GpuCommand::BindDescriptorSet { index: MATERIAL_SET, .. }
            )),
            3
        );
        // Scene set survives the pipeline switch
        assert_eq!(
            count(&commands, |c| matches!(
                c,
                GpuCommand::BindDescriptorSet { index: SCENE_SET, .. }
            )),
            1
        );
        // Geometry is shared by every draw
        assert_eq!(count(&commands, |c| matches!(c, GpuCommand::BindVertexBuffer(_))), 1);
    }

    #[test]
    fn test_scenes_in_order_instanced_before_explicit() {
        let mut acc = DrawAccumulator::new();
        let late = SceneKey { order: 5, id: 1 };
        let early = SceneKey { order: -1, id: 2 };

        acc.add_commands(
            early,
            set(61),
            vec![
                ResolvedCommand::Pipeline(pipeline(3)),
                ResolvedCommand::VertexBuffer(binding(1)),
                ResolvedCommand::IndexBuffer(binding(2), vk::IndexType::UINT16),
                ResolvedCommand::Draw {
                    index_count: 3,
                    first_index: 0,
                    vertex_offset: 0,
                },
            ],
        );
        acc.add_draw(late, set(60), draw(1, 10, 20));
        acc.add_draw(early, set(61), draw(1, 10, 20));

        let (commands, _) = acc.compile(full());
        let draws: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                GpuCommand::DrawIndexed { index_count, .. } => Some(*index_count),
                _ => None,
            })
            .collect();
        // early instanced, early explicit, late instanced
        assert_eq!(draws, vec![6, 3, 6]);

        let scene_sets: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                GpuCommand::BindDescriptorSet {
                    index: SCENE_SET,
                    set,
                    ..
                } => Some(*set),
                _ => None,
            })
            .collect();
        // The explicit batch starts from a reset and rebinds the scene
        assert_eq!(scene_sets, vec![set(61), set(61), set(60)]);
    }

    #[test]
    fn test_explicit_redundant_switches_elided() {
        let mut acc = DrawAccumulator::new();
        let draw = ResolvedCommand::Draw {
            index_count: 3,
            first_index: 0,
            vertex_offset: 0,
        };
        acc.add_commands(
            SCENE,
            vk::DescriptorSet::null(),
            vec![
                ResolvedCommand::Pipeline(pipeline(1)),
                ResolvedCommand::VertexBuffer(binding(1)),
                ResolvedCommand::IndexBuffer(binding(2), vk::IndexType::UINT32),
                ResolvedCommand::MaterialSet(set(10)),
                draw,
                ResolvedCommand::Pipeline(pipeline(1)),
                ResolvedCommand::MaterialSet(set(10)),
                draw,
                ResolvedCommand::MaterialSet(set(11)),
                ResolvedCommand::MaterialSet(set(10)),
                draw,
            ],
        );

        let (commands, stats) = acc.compile(full());
        // pipeline + material + vertex + index, then nothing new
        assert_eq!(stats.binds, 4);
        assert_eq!(stats.draws, 3);
        assert!(commands[..4].iter().all(GpuCommand::is_bind));
    }

    #[test]
    fn test_hundred_draws_one_vertex_bind() {
        let mut acc = DrawAccumulator::new();
        let mut commands = vec![
            ResolvedCommand::Pipeline(pipeline(1)),
            ResolvedCommand::IndexBuffer(binding(2), vk::IndexType::UINT32),
        ];
        for i in 0..100 {
            commands.push(ResolvedCommand::VertexBuffer(binding(1)));
            commands.push(ResolvedCommand::Draw {
                index_count: 3,
                first_index: i * 3,
                vertex_offset: 0,
            });
        }
        acc.add_commands(SCENE, vk::DescriptorSet::null(), commands);

        let (commands, stats) = acc.compile(full());
        let vertex_binds = commands
            .iter()
            .filter(|c| matches!(c, GpuCommand::BindVertexBuffer(_)))
            .count();
        assert_eq!(vertex_binds, 1);
        assert_eq!(stats.draws, 100);
    }

    #[test]
    fn test_reset_forces_rebind() {
        let mut acc = DrawAccumulator::new();
        let draw = ResolvedCommand::Draw {
            index_count: 3,
            first_index: 0,
            vertex_offset: 0,
        };
        let state = [
            ResolvedCommand::Pipeline(pipeline(1)),
            ResolvedCommand::VertexBuffer(binding(1)),
            ResolvedCommand::IndexBuffer(binding(2), vk::IndexType::UINT32),
        ];
        let mut commands = state.to_vec();
        commands.push(draw);
        commands.push(ResolvedCommand::Reset);
        commands.push(draw);
        commands.extend(state);
        commands.push(draw);
        acc.add_commands(SCENE, vk::DescriptorSet::null(), commands);

        let (compiled, stats) = acc.compile(full());
        // The draw right after the reset has no state and is dropped
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.draws, 2);
        assert_eq!(count(&compiled, |c| matches!(c, GpuCommand::BindPipeline(_))), 2);
    }

    #[test]
    fn test_scissor_changes_only() {
        let mut acc = DrawAccumulator::new();
        let rect = vk::Rect2D {
            offset: vk::Offset2D { x: 10, y: 10 },
            extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
        };
        let draw = ResolvedCommand::Draw {
            index_count: 3,
            first_index: 0,
            vertex_offset: 0,
        };
        acc.add_commands(
            SCENE,
            vk::DescriptorSet::null(),
            vec![
                ResolvedCommand::Pipeline(pipeline(1)),
                ResolvedCommand::VertexBuffer(binding(1)),
                ResolvedCommand::IndexBuffer(binding(2), vk::IndexType::UINT32),
                draw,
                ResolvedCommand::Scissor(rect),
                draw,
                ResolvedCommand::Scissor(rect),
                draw,
                ResolvedCommand::Scissor(full()),
                draw,
            ],
        );

        let (commands, _) = acc.compile(full());
        let scissors: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                GpuCommand::SetScissor(r) => Some(*r),
                _ => None,
            })
            .collect();
        assert_eq!(scissors, vec![rect, full()]);
    }

    #[test]
    fn test_clear() {
        let mut acc = DrawAccumulator::new();
        acc.add_draw(SCENE, set(50), draw(1, 10, 20));
        assert!(!acc.is_empty());
        acc.clear();
        assert!(acc.is_empty());
        assert!(acc.compile(full()).0.is_empty());
    }
}
