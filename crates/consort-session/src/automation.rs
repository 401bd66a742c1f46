//! Real-time parameter automation.
//!
//! Each block the engine reconciles up to three sources of parameter values
//! and writes only what changed into the module:
//!
//! 1. **Bus mappings**: a parameter follows a host control bus (one value per
//!    block) or audio bus (one value per sample).
//! 2. **Inline inputs**: `(index, signal)` pairs fed directly by the unit.
//!    Skipped for indices that are already mapped.
//! 3. **Explicit sets** from commands, which write through immediately and
//!    remove any mapping on that index.
//!
//! Audio-rate signals are applied per sample only when the module says it
//! honours sample offsets. Otherwise (or when it does not say) only the
//! first sample of the block is used.
//!
//! Nothing here allocates after [`AutomationEngine::reset`].

use consort_core::PluginInstance;

/// Rate of the bus a parameter is mapped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    Control,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub index: usize,
    pub bus: usize,
    pub kind: BusKind,
}

/// Read access to the host's busses for the current block.
pub trait BusReader {
    fn control(&self, bus: usize) -> Option<f32>;

    fn audio(&self, bus: usize) -> Option<&[f32]>;
}

/// Bus values laid out as plain slices, indexed by bus number.
#[derive(Debug, Clone, Copy, Default)]
pub struct Buses<'a> {
    pub control: &'a [f32],
    pub audio: &'a [&'a [f32]],
}

impl BusReader for Buses<'_> {
    fn control(&self, bus: usize) -> Option<f32> {
        self.control.get(bus).copied()
    }

    fn audio(&self, bus: usize) -> Option<&[f32]> {
        self.audio.get(bus).copied()
    }
}

/// A parameter value signal for one block.
#[derive(Debug, Clone, Copy)]
pub enum Signal<'a> {
    Control(f32),
    Audio(&'a [f32]),
}

/// Inline automation input: drives parameter `index` directly.
#[derive(Debug, Clone, Copy)]
pub struct InlineParam<'a> {
    pub index: usize,
    pub value: Signal<'a>,
}

/// Everything automation reads during one block.
#[derive(Clone, Copy)]
pub struct BlockAutomation<'a> {
    pub buses: &'a dyn BusReader,
    pub inline: &'a [InlineParam<'a>],
}

static NO_BUSES: Buses<'static> = Buses {
    control: &[],
    audio: &[],
};

impl BlockAutomation<'static> {
    /// No busses, no inline inputs.
    pub fn none() -> Self {
        Self {
            buses: &NO_BUSES,
            inline: &[],
        }
    }
}

impl<'a> BlockAutomation<'a> {
    pub fn new(buses: &'a dyn BusReader, inline: &'a [InlineParam<'a>]) -> Self {
        Self { buses, inline }
    }
}

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct Node {
    mapping: Mapping,
    prev: usize,
    next: usize,
}

/// Parameter-to-bus mappings in insertion order.
///
/// An index-based doubly-linked list over a node arena with a free list,
/// plus a dense `parameter -> node` table, so membership, insertion and
/// removal are O(1) and iteration costs only as much as there are mappings.
/// A parameter appears at most once.
#[derive(Debug)]
pub struct MappingList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    lookup: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
}

impl Default for MappingList {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            lookup: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }
}

impl MappingList {
    pub fn new(num_params: usize) -> Self {
        let mut list = Self::default();
        list.reset(num_params);
        list
    }

    /// Drop all mappings and size the list for `num_params` parameters.
    pub fn reset(&mut self, num_params: usize) {
        self.nodes.clear();
        self.free.clear();
        self.lookup.clear();
        self.lookup.resize(num_params, NIL);
        // every parameter maps at most once, so the arena never grows past this
        self.nodes.reserve(num_params);
        self.free.reserve(num_params);
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }

    pub fn num_params(&self) -> usize {
        self.lookup.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Option<Mapping> {
        match self.lookup.get(index) {
            Some(&slot) if slot != NIL => Some(self.nodes[slot].mapping),
            _ => None,
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    /// Map `index` to a bus, replacing any previous mapping of that index in
    /// place. Returns false if `index` is out of range.
    pub fn insert(&mut self, index: usize, bus: usize, kind: BusKind) -> bool {
        let Some(&slot) = self.lookup.get(index) else {
            return false;
        };
        let mapping = Mapping { index, bus, kind };
        if slot != NIL {
            self.nodes[slot].mapping = mapping;
            return true;
        }

        let node = Node {
            mapping,
            prev: self.tail,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        if self.tail != NIL {
            self.nodes[self.tail].next = slot;
        } else {
            self.head = slot;
        }
        self.tail = slot;
        self.lookup[index] = slot;
        self.len += 1;
        true
    }

    /// Returns the removed mapping, if there was one.
    pub fn remove(&mut self, index: usize) -> Option<Mapping> {
        let slot = *self.lookup.get(index)?;
        if slot == NIL {
            return None;
        }
        let Node { mapping, prev, next } = self.nodes[slot];
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.lookup[index] = NIL;
        self.free.push(slot);
        self.len -= 1;
        Some(mapping)
    }

    pub fn clear(&mut self) {
        let num_params = self.num_params();
        self.reset(num_params);
    }

    pub fn iter(&self) -> MappingIter<'_> {
        MappingIter {
            list: self,
            cursor: self.head,
        }
    }
}

pub struct MappingIter<'a> {
    list: &'a MappingList,
    cursor: usize,
}

impl Iterator for MappingIter<'_> {
    type Item = Mapping;

    fn next(&mut self) -> Option<Mapping> {
        if self.cursor == NIL {
            return None;
        }
        let node = &self.list.nodes[self.cursor];
        self.cursor = node.next;
        Some(node.mapping)
    }
}

/// Mappings plus the last value written to each parameter.
#[derive(Debug, Default)]
pub struct AutomationEngine {
    mappings: MappingList,
    last: Vec<Option<f32>>,
}

impl AutomationEngine {
    pub fn new(num_params: usize) -> Self {
        let mut engine = Self::default();
        engine.reset(num_params);
        engine
    }

    /// Resize for a newly loaded module. Clears mappings and recorded values.
    pub fn reset(&mut self, num_params: usize) {
        self.mappings.reset(num_params);
        self.last.clear();
        self.last.resize(num_params, None);
    }

    pub fn num_params(&self) -> usize {
        self.last.len()
    }

    pub fn mappings(&self) -> &MappingList {
        &self.mappings
    }

    pub fn mapping(&self, index: usize) -> Option<Mapping> {
        self.mappings.get(index)
    }

    pub fn map(&mut self, index: usize, bus: usize, kind: BusKind) -> bool {
        self.mappings.insert(index, bus, kind)
    }

    pub fn unmap(&mut self, index: usize) -> bool {
        self.mappings.remove(index).is_some()
    }

    pub fn unmap_all(&mut self) {
        self.mappings.clear();
    }

    pub fn last_value(&self, index: usize) -> Option<f32> {
        self.last.get(index).copied().flatten()
    }

    /// Note a value the module now holds without writing it.
    pub fn record(&mut self, index: usize, value: f32) {
        if let Some(slot) = self.last.get_mut(index) {
            *slot = Some(value);
        }
    }

    /// Forget every recorded value so the next block rewrites all automated
    /// parameters (after a preset load replaced them wholesale).
    pub fn invalidate(&mut self) {
        self.last.fill(None);
    }

    /// Explicit set from a command: clears the mapping on `index` and writes
    /// through regardless of the recorded value.
    pub fn set_explicit(&mut self, plugin: &mut dyn PluginInstance, index: usize, value: f32) -> bool {
        if index >= self.last.len() || index >= plugin.num_parameters() {
            return false;
        }
        self.mappings.remove(index);
        plugin.set_parameter(index, value, 0);
        self.last[index] = Some(value);
        true
    }

    /// Apply one block of automation. Returns the number of parameter writes.
    pub fn process(
        &mut self,
        plugin: &mut dyn PluginInstance,
        automation: &BlockAutomation<'_>,
        num_samples: usize,
    ) -> usize {
        // unknown capability is treated as block rate
        let sample_accurate = plugin.sample_accurate_parameters().unwrap_or(false);
        let num_params = self.last.len().min(plugin.num_parameters());
        let mut writes = 0;

        let Self { mappings, last } = self;
        for mapping in mappings.iter() {
            if mapping.index >= num_params {
                continue;
            }
            let signal = match mapping.kind {
                BusKind::Control => automation.buses.control(mapping.bus).map(Signal::Control),
                BusKind::Audio => automation.buses.audio(mapping.bus).map(Signal::Audio),
            };
            if let Some(signal) = signal {
                let slot = &mut last[mapping.index];
                writes += apply(plugin, slot, mapping.index, signal, num_samples, sample_accurate);
            }
        }

        for input in automation.inline {
            if input.index >= num_params || mappings.contains(input.index) {
                continue;
            }
            let slot = &mut last[input.index];
            writes += apply(plugin, slot, input.index, input.value, num_samples, sample_accurate);
        }
        writes
    }
}

#[inline]
fn write_if_changed(
    plugin: &mut dyn PluginInstance,
    last: &mut Option<f32>,
    index: usize,
    value: f32,
    offset: usize,
) -> usize {
    if *last == Some(value) {
        return 0;
    }
    plugin.set_parameter(index, value, offset);
    *last = Some(value);
    1
}

fn apply(
    plugin: &mut dyn PluginInstance,
    last: &mut Option<f32>,
    index: usize,
    signal: Signal<'_>,
    num_samples: usize,
    sample_accurate: bool,
) -> usize {
    match signal {
        Signal::Control(value) => write_if_changed(plugin, last, index, value, 0),
        Signal::Audio(samples) => {
            let samples = &samples[..samples.len().min(num_samples)];
            if !sample_accurate {
                return match samples.first() {
                    Some(&value) => write_if_changed(plugin, last, index, value, 0),
                    None => 0,
                };
            }
            samples
                .iter()
                .enumerate()
                .map(|(offset, &value)| write_if_changed(plugin, last, index, value, offset))
                .sum()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consort_core::{
        AudioBuffers, BypassMode, ParamInfo, PluginDescriptor, PluginListener, Precision,
        ProcessContext, Rect, Result, Window,
    };
    use std::sync::Arc;

    struct Recorder {
        descriptor: Arc<PluginDescriptor>,
        sample_accurate: Option<bool>,
        writes: Vec<(usize, f32, usize)>,
    }

    impl Recorder {
        fn new(num_params: u32, sample_accurate: Option<bool>) -> Self {
            let mut desc = PluginDescriptor::new("Recorder", "/plugins/recorder.so");
            for id in 0..num_params {
                desc.add_param(ParamInfo::new(format!("P{}", id), "", id));
            }
            Self {
                descriptor: Arc::new(desc),
                sample_accurate,
                writes: Vec::new(),
            }
        }
    }

    impl PluginInstance for Recorder {
        fn descriptor(&self) -> &Arc<PluginDescriptor> {
            &self.descriptor
        }
        fn setup(&mut self, _: f64, _: usize, _: Precision) {}
        fn set_num_channels(&mut self, _: usize, _: usize, _: usize, _: usize) {}
        fn suspend(&mut self) {}
        fn resume(&mut self) {}
        fn set_bypass(&mut self, _: BypassMode) {}
        fn sample_accurate_parameters(&self) -> Option<bool> {
            self.sample_accurate
        }
        fn process_f32(&mut self, _: &mut AudioBuffers<'_, '_, f32>, _: &ProcessContext<'_>) {}
        fn process_f64(&mut self, _: &mut AudioBuffers<'_, '_, f64>, _: &ProcessContext<'_>) {}
        fn set_parameter(&mut self, index: usize, value: f32, offset: usize) {
            self.writes.push((index, value, offset));
        }
        fn set_parameter_string(&mut self, _: usize, _: &str, _: usize) -> bool {
            false
        }
        fn get_parameter(&self, _: usize) -> f32 {
            0.0
        }
        fn parameter_display(&self, _: usize) -> String {
            String::new()
        }
        fn set_program(&mut self, _: usize) {}
        fn program(&self) -> usize {
            0
        }
        fn program_name(&self, _: usize) -> String {
            String::new()
        }
        fn set_program_name(&mut self, _: &str) {}
        fn read_program_data(&mut self, _: &[u8]) -> Result<()> {
            Ok(())
        }
        fn write_program_data(&mut self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn read_bank_data(&mut self, _: &[u8]) -> Result<()> {
            Ok(())
        }
        fn write_bank_data(&mut self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn vendor_specific(&mut self, _: i32, _: isize, _: &mut [u8], _: f32) -> isize {
            0
        }
        fn open_editor(&mut self, _: &dyn Window) -> Result<()> {
            Ok(())
        }
        fn close_editor(&mut self) {}
        fn editor_rect(&self) -> Option<Rect> {
            None
        }
        fn set_listener(&mut self, _: Option<Arc<dyn PluginListener>>) {}
    }

    #[test]
    fn test_mapping_list_insert_remove() {
        let mut list = MappingList::new(8);
        assert!(list.insert(3, 0, BusKind::Control));
        assert!(list.insert(1, 1, BusKind::Audio));
        assert!(list.insert(5, 2, BusKind::Control));
        assert!(!list.insert(8, 0, BusKind::Control));
        assert_eq!(list.len(), 3);

        // remapping keeps the position
        assert!(list.insert(3, 7, BusKind::Audio));
        let order: Vec<usize> = list.iter().map(|m| m.index).collect();
        assert_eq!(order, [3, 1, 5]);
        assert_eq!(list.get(3).map(|m| m.bus), Some(7));

        assert_eq!(list.remove(1).map(|m| m.bus), Some(1));
        assert!(list.remove(1).is_none());
        let order: Vec<usize> = list.iter().map(|m| m.index).collect();
        assert_eq!(order, [3, 5]);

        // freed slots are reused
        list.insert(0, 4, BusKind::Control);
        assert_eq!(list.nodes.len(), 3);
        let order: Vec<usize> = list.iter().map(|m| m.index).collect();
        assert_eq!(order, [3, 5, 0]);

        list.remove(3);
        list.remove(0);
        let order: Vec<usize> = list.iter().map(|m| m.index).collect();
        assert_eq!(order, [5]);
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.iter().count(), 0);
    }

    #[test]
    fn test_control_bus_writes_only_changes() {
        let mut plugin = Recorder::new(4, None);
        let mut engine = AutomationEngine::new(4);
        engine.map(0, 5, BusKind::Control);

        let mut control = [0.0f32; 8];
        control[5] = 0.25;
        for _ in 0..10 {
            let buses = Buses {
                control: &control,
                audio: &[],
            };
            engine.process(&mut plugin, &BlockAutomation::new(&buses, &[]), 64);
        }
        assert_eq!(plugin.writes, vec![(0, 0.25, 0)]);

        control[5] = 0.5;
        let buses = Buses {
            control: &control,
            audio: &[],
        };
        engine.process(&mut plugin, &BlockAutomation::new(&buses, &[]), 64);
        assert_eq!(plugin.writes.last(), Some(&(0, 0.5, 0)));
    }

    #[test]
    fn test_audio_bus_sample_accurate() {
        let samples = [0.1f32, 0.1, 0.2, 0.2, 0.3, 0.3, 0.3, 0.1];
        let audio: [&[f32]; 1] = [&samples];
        let buses = Buses {
            control: &[],
            audio: &audio,
        };

        let mut plugin = Recorder::new(2, Some(true));
        let mut engine = AutomationEngine::new(2);
        engine.map(1, 0, BusKind::Audio);
        engine.process(&mut plugin, &BlockAutomation::new(&buses, &[]), 8);
        assert_eq!(
            plugin.writes,
            vec![(1, 0.1, 0), (1, 0.2, 2), (1, 0.3, 4), (1, 0.1, 7)]
        );
    }

    #[test]
    fn test_audio_bus_block_rate_fallback() {
        let samples = [0.1f32, 0.2, 0.3, 0.4];
        let audio: [&[f32]; 1] = [&samples];
        let buses = Buses {
            control: &[],
            audio: &audio,
        };

        for capability in [None, Some(false)] {
            let mut plugin = Recorder::new(2, capability);
            let mut engine = AutomationEngine::new(2);
            engine.map(0, 0, BusKind::Audio);
            engine.process(&mut plugin, &BlockAutomation::new(&buses, &[]), 4);
            assert_eq!(plugin.writes, vec![(0, 0.1, 0)]);
        }
    }

    #[test]
    fn test_inline_inputs_skip_mapped_parameters() {
        let mut plugin = Recorder::new(3, None);
        let mut engine = AutomationEngine::new(3);
        engine.map(0, 0, BusKind::Control);

        let control = [0.9f32];
        let buses = Buses {
            control: &control,
            audio: &[],
        };
        let inline = [
            InlineParam {
                index: 0,
                value: Signal::Control(0.1),
            },
            InlineParam {
                index: 2,
                value: Signal::Control(0.7),
            },
        ];
        let writes = engine.process(&mut plugin, &BlockAutomation::new(&buses, &inline), 16);
        assert_eq!(writes, 2);
        // mapped parameters go first
        assert_eq!(plugin.writes, vec![(0, 0.9, 0), (2, 0.7, 0)]);
    }

    #[test]
    fn test_explicit_set_clears_mapping() {
        let mut plugin = Recorder::new(2, None);
        let mut engine = AutomationEngine::new(2);
        engine.map(1, 0, BusKind::Control);
        engine.record(1, 0.5);

        // writes even though the value is unchanged
        assert!(engine.set_explicit(&mut plugin, 1, 0.5));
        assert!(engine.mapping(1).is_none());
        assert_eq!(plugin.writes, vec![(1, 0.5, 0)]);
        assert!(!engine.set_explicit(&mut plugin, 2, 0.5));
    }

    #[test]
    fn test_out_of_range_indices_are_skipped() {
        // engine sized for a bigger module than the one now loaded
        let mut plugin = Recorder::new(1, None);
        let mut engine = AutomationEngine::new(4);
        engine.map(3, 0, BusKind::Control);
        let control = [0.3f32];
        let buses = Buses {
            control: &control,
            audio: &[],
        };
        let inline = [InlineParam {
            index: 9,
            value: Signal::Control(0.1),
        }];
        assert_eq!(engine.process(&mut plugin, &BlockAutomation::new(&buses, &inline), 8), 0);
        assert!(plugin.writes.is_empty());
    }

    #[test]
    fn test_invalidate_forces_rewrite() {
        let mut plugin = Recorder::new(1, None);
        let mut engine = AutomationEngine::new(1);
        engine.map(0, 0, BusKind::Control);
        let control = [0.4f32];
        let buses = Buses {
            control: &control,
            audio: &[],
        };
        let automation = BlockAutomation::new(&buses, &[]);
        engine.process(&mut plugin, &automation, 8);
        engine.process(&mut plugin, &automation, 8);
        engine.invalidate();
        engine.process(&mut plugin, &automation, 8);
        assert_eq!(plugin.writes.len(), 2);
    }
}
