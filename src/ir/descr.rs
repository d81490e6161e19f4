//! Descriptors: struct layouts, fields, arrays and call signatures
//!
//! Every descriptor lives in a [`DescrTable`] and is referred to by a
//! [`DescrRef`] index, so caches can key on descriptors cheaply. The table is
//! shared (via `Rc`) between a trace and everything optimized from it.

use super::Type;
use bitflags::bitflags;
use rustc_hash::FxHashMap as HashMap;
use std::fmt;

/// Index of a descriptor in a [`DescrTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescrRef(pub u32);

/// Layout of a fixed-size struct
#[derive(Debug, Clone)]
pub struct SizeDescr {
    pub name: String,
    pub fields: Vec<DescrRef>,
    /// Class id for objects allocated with `new_with_vtable`
    pub vtable: Option<i64>,
    /// All fields are immutable
    pub immutable: bool,
}

/// One field of a struct
#[derive(Debug, Clone)]
pub struct FieldDescr {
    pub name: String,
    pub owner: DescrRef,
    /// Slot index within the owner's field list
    pub index: usize,
    pub ty: Type,
    pub immutable: bool,
    pub quasi_immutable: bool,
}

/// Layout of an array (of primitives or of structs)
#[derive(Debug, Clone)]
pub struct ArrayDescr {
    pub name: String,
    pub item_ty: Type,
    /// Item size in bytes, used for raw memory offsets
    pub item_size: i64,
    /// Interior field descrs when this is an array of structs
    pub interior: Vec<DescrRef>,
    pub immutable: bool,
}

impl ArrayDescr {
    pub fn is_array_of_structs(&self) -> bool {
        !self.interior.is_empty()
    }
}

/// One field of the structs stored inline in an array of structs
#[derive(Debug, Clone)]
pub struct InteriorFieldDescr {
    pub name: String,
    pub array: DescrRef,
    pub index: usize,
    pub ty: Type,
}

bitflags! {
    /// Effect flags of a call
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EffectFlags: u16 {
        /// The call may raise an exception
        const CAN_RAISE = 1 << 0;
        /// The call may read or write anything
        const RANDOM_EFFECTS = 1 << 1;
        /// The call may force virtual references or virtualizables
        const FORCES_VIRTUAL_OR_VIRTUALIZABLE = 1 << 2;
        /// The call may mutate quasi-immutable fields
        const CAN_INVALIDATE = 1 << 3;
        /// Same arguments give the same result, no observable effects
        const ELIDABLE = 1 << 4;
        /// Same result for the whole duration of a loop
        const LOOP_INVARIANT = 1 << 5;
        /// The call may run the garbage collector
        const CAN_COLLECT = 1 << 6;
    }
}

/// Helpers with semantics the optimizer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OopSpec {
    None,
    StrConcat(StrMode),
    StrSlice(StrMode),
    StrEqual(StrMode),
    StrEqualSliceChecknull(StrMode),
    StrEqualSliceNonnull(StrMode),
    StrEqualSliceChar(StrMode),
    StrEqualNonnull(StrMode),
    StrEqualChecknullChar(StrMode),
    StrEqualNonnullChar(StrMode),
    StrEqualLengthok(StrMode),
    StrCmp(StrMode),
    /// Convert a byte string to a unicode string
    Str2Unicode,
    /// Truncate a freshly built string to the given length
    ShrinkArray(StrMode),
    DictLookup,
    JitForceVirtual,
    JitForceVirtualizable,
    RawMallocVarsizeChar,
    RawFree,
}

impl OopSpec {
    /// The string mode this helper operates on
    pub fn str_mode(self) -> Option<StrMode> {
        use OopSpec::*;
        match self {
            StrConcat(m) | StrSlice(m) | StrEqual(m) | StrEqualSliceChecknull(m)
            | StrEqualSliceNonnull(m) | StrEqualSliceChar(m) | StrEqualNonnull(m)
            | StrEqualChecknullChar(m) | StrEqualNonnullChar(m) | StrEqualLengthok(m)
            | StrCmp(m) | ShrinkArray(m) => Some(m),
            _ => Option::None,
        }
    }

    /// Name used by `oopspec=` in the text format
    pub fn name(self) -> String {
        use OopSpec::*;
        let (base, mode) = match self {
            None => return "none".to_string(),
            Str2Unicode => return "str2unicode".to_string(),
            DictLookup => return "dict_lookup".to_string(),
            JitForceVirtual => return "jit_force_virtual".to_string(),
            JitForceVirtualizable => return "jit_force_virtualizable".to_string(),
            RawMallocVarsizeChar => return "raw_malloc_varsize_char".to_string(),
            RawFree => return "raw_free".to_string(),
            StrConcat(m) => ("concat", m),
            StrSlice(m) => ("slice", m),
            StrEqual(m) => ("equal", m),
            StrEqualSliceChecknull(m) => ("equal_slice_checknull", m),
            StrEqualSliceNonnull(m) => ("equal_slice_nonnull", m),
            StrEqualSliceChar(m) => ("equal_slice_char", m),
            StrEqualNonnull(m) => ("equal_nonnull", m),
            StrEqualChecknullChar(m) => ("equal_checknull_char", m),
            StrEqualNonnullChar(m) => ("equal_nonnull_char", m),
            StrEqualLengthok(m) => ("equal_lengthok", m),
            StrCmp(m) => ("cmp", m),
            ShrinkArray(m) => ("shrink_array", m),
        };
        format!("{}_{}", mode.prefix(), base)
    }

    /// Parse an `oopspec=` name
    pub fn from_name(name: &str) -> Option<OopSpec> {
        use OopSpec::*;
        match name {
            "none" => return Some(None),
            "str2unicode" => return Some(Str2Unicode),
            "dict_lookup" => return Some(DictLookup),
            "jit_force_virtual" => return Some(JitForceVirtual),
            "jit_force_virtualizable" => return Some(JitForceVirtualizable),
            "raw_malloc_varsize_char" => return Some(RawMallocVarsizeChar),
            "raw_free" => return Some(RawFree),
            _ => {}
        }
        let (mode, rest) = if let Some(rest) = name.strip_prefix("str_") {
            (StrMode::Str, rest)
        } else if let Some(rest) = name.strip_prefix("uni_") {
            (StrMode::Unicode, rest)
        } else {
            return Option::None;
        };
        Some(match rest {
            "concat" => StrConcat(mode),
            "slice" => StrSlice(mode),
            "equal" => StrEqual(mode),
            "equal_slice_checknull" => StrEqualSliceChecknull(mode),
            "equal_slice_nonnull" => StrEqualSliceNonnull(mode),
            "equal_slice_char" => StrEqualSliceChar(mode),
            "equal_nonnull" => StrEqualNonnull(mode),
            "equal_checknull_char" => StrEqualChecknullChar(mode),
            "equal_nonnull_char" => StrEqualNonnullChar(mode),
            "equal_lengthok" => StrEqualLengthok(mode),
            "cmp" => StrCmp(mode),
            "shrink_array" => ShrinkArray(mode),
            _ => return Option::None,
        })
    }
}

/// Byte strings or unicode strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StrMode {
    Str,
    Unicode,
}

impl StrMode {
    pub fn prefix(self) -> &'static str {
        match self {
            StrMode::Str => "str",
            StrMode::Unicode => "uni",
        }
    }

    /// Largest character code
    pub fn max_char(self) -> i64 {
        match self {
            StrMode::Str => 255,
            StrMode::Unicode => 0x10FFFF,
        }
    }
}

/// Static effect summary of a call
#[derive(Debug, Clone, Default)]
pub struct EffectInfo {
    pub flags: EffectFlags,
    pub read_fields: Vec<DescrRef>,
    pub write_fields: Vec<DescrRef>,
    pub read_arrays: Vec<DescrRef>,
    pub write_arrays: Vec<DescrRef>,
    pub oopspec: Option<OopSpec>,
    /// Storage array of the dictionary for dict lookups
    pub dict_storage: Option<DescrRef>,
}

impl EffectInfo {
    pub fn has_random_effects(&self) -> bool {
        self.flags.contains(EffectFlags::RANDOM_EFFECTS)
    }

    pub fn can_raise(&self) -> bool {
        self.flags.contains(EffectFlags::CAN_RAISE)
    }

    pub fn is_elidable(&self) -> bool {
        self.flags.contains(EffectFlags::ELIDABLE)
    }

    pub fn can_invalidate(&self) -> bool {
        self.flags
            .intersects(EffectFlags::CAN_INVALIDATE | EffectFlags::RANDOM_EFFECTS)
    }

    pub fn forces_virtual_or_virtualizable(&self) -> bool {
        self.flags
            .contains(EffectFlags::FORCES_VIRTUAL_OR_VIRTUALIZABLE)
    }

    pub fn oopspec(&self) -> OopSpec {
        self.oopspec.unwrap_or(OopSpec::None)
    }

    /// Whether the call may write the given field
    pub fn writes_field(&self, descr: DescrRef) -> bool {
        self.has_random_effects() || self.write_fields.contains(&descr)
    }

    /// Whether the call may read the given field
    pub fn reads_field(&self, descr: DescrRef) -> bool {
        self.has_random_effects() || self.read_fields.contains(&descr)
    }

    pub fn writes_array(&self, descr: DescrRef) -> bool {
        self.has_random_effects() || self.write_arrays.contains(&descr)
    }

    pub fn reads_array(&self, descr: DescrRef) -> bool {
        self.has_random_effects() || self.read_arrays.contains(&descr)
    }
}

/// Signature of a called function
#[derive(Debug, Clone)]
pub struct CallDescr {
    pub name: String,
    pub arg_types: Vec<Type>,
    pub result: Type,
    pub effect: EffectInfo,
}

/// A descriptor
#[derive(Debug, Clone)]
pub enum Descr {
    Size(SizeDescr),
    Field(FieldDescr),
    Array(ArrayDescr),
    InteriorField(InteriorFieldDescr),
    Call(CallDescr),
}

/// Well-known descriptors registered in every table
#[derive(Debug, Clone, Copy)]
pub struct VrefDescrs {
    pub size: DescrRef,
    pub virtual_token: DescrRef,
    pub forced: DescrRef,
    /// Class id of virtual reference objects
    pub class: i64,
}

/// Class id reserved for virtual references
pub const VREF_CLASS: i64 = 0x7ef;

/// Table of all descriptors used by a trace
#[derive(Debug, Clone)]
pub struct DescrTable {
    descrs: Vec<Descr>,
    by_name: HashMap<String, DescrRef>,
    helpers: HashMap<OopSpec, DescrRef>,
    vref: VrefDescrs,
    /// Prebuilt constant objects: name and layout
    objects: Vec<(String, DescrRef)>,
}

impl DescrTable {
    /// Create a table with the builtin helpers registered
    pub fn new() -> Self {
        let mut table = DescrTable {
            descrs: Vec::new(),
            by_name: HashMap::default(),
            helpers: HashMap::default(),
            vref: VrefDescrs {
                size: DescrRef(0),
                virtual_token: DescrRef(0),
                forced: DescrRef(0),
                class: VREF_CLASS,
            },
            objects: Vec::new(),
        };
        let size = table.add_struct("jit_virtual_ref", Some(VREF_CLASS), false);
        let virtual_token = table.add_field(size, "virtual_token", Type::Int, false);
        let forced = table.add_field(size, "forced", Type::Ref, false);
        table.vref = VrefDescrs {
            size,
            virtual_token,
            forced,
            class: VREF_CLASS,
        };
        table.register_builtin_helpers();
        table
    }

    fn register_builtin_helpers(&mut self) {
        use OopSpec::*;
        let elidable = EffectFlags::ELIDABLE;
        for mode in [StrMode::Str, StrMode::Unicode] {
            let r = Type::Ref;
            let i = Type::Int;
            let helpers: [(OopSpec, Vec<Type>, Type); 12] = [
                (StrConcat(mode), vec![r, r], r),
                (StrSlice(mode), vec![r, i, i], r),
                (StrEqual(mode), vec![r, r], i),
                (StrEqualSliceChecknull(mode), vec![r, i, i, r], i),
                (StrEqualSliceNonnull(mode), vec![r, i, i, r], i),
                (StrEqualSliceChar(mode), vec![r, i, i, i], i),
                (StrEqualNonnull(mode), vec![r, r], i),
                (StrEqualChecknullChar(mode), vec![r, i], i),
                (StrEqualNonnullChar(mode), vec![r, i], i),
                (StrEqualLengthok(mode), vec![r, r], i),
                (StrCmp(mode), vec![r, r], i),
                (ShrinkArray(mode), vec![r, i], r),
            ];
            for (spec, args, result) in helpers {
                let mut flags = elidable | EffectFlags::CAN_COLLECT;
                if matches!(spec, StrConcat(_) | StrSlice(_) | ShrinkArray(_)) {
                    flags |= EffectFlags::CAN_RAISE;
                }
                self.add_helper(spec, args, result, flags);
            }
        }
        self.add_helper(
            Str2Unicode,
            vec![Type::Ref],
            Type::Ref,
            EffectFlags::ELIDABLE | EffectFlags::CAN_RAISE,
        );
        self.add_helper(
            JitForceVirtual,
            vec![Type::Ref],
            Type::Ref,
            EffectFlags::FORCES_VIRTUAL_OR_VIRTUALIZABLE,
        );
        self.add_helper(
            JitForceVirtualizable,
            vec![Type::Ref],
            Type::Void,
            EffectFlags::FORCES_VIRTUAL_OR_VIRTUALIZABLE,
        );
        self.add_helper(
            RawMallocVarsizeChar,
            vec![Type::Int],
            Type::Int,
            EffectFlags::CAN_RAISE,
        );
        self.add_helper(RawFree, vec![Type::Int], Type::Void, EffectFlags::empty());
    }

    fn add_helper(&mut self, spec: OopSpec, arg_types: Vec<Type>, result: Type, flags: EffectFlags) {
        let descr = self.add_call(CallDescr {
            name: spec.name(),
            arg_types,
            result,
            effect: EffectInfo {
                flags,
                oopspec: Some(spec),
                ..EffectInfo::default()
            },
        });
        self.helpers.insert(spec, descr);
    }

    fn push(&mut self, name: String, descr: Descr) -> DescrRef {
        let r = DescrRef(self.descrs.len() as u32);
        self.descrs.push(descr);
        self.by_name.insert(name, r);
        r
    }

    /// Register a struct layout
    pub fn add_struct(&mut self, name: &str, vtable: Option<i64>, immutable: bool) -> DescrRef {
        self.push(
            name.to_string(),
            Descr::Size(SizeDescr {
                name: name.to_string(),
                fields: Vec::new(),
                vtable,
                immutable,
            }),
        )
    }

    /// Register a field of a struct; its name is `Struct.field`
    pub fn add_field(&mut self, owner: DescrRef, name: &str, ty: Type, immutable: bool) -> DescrRef {
        self.add_field_ext(owner, name, ty, immutable, false)
    }

    pub fn add_field_ext(
        &mut self,
        owner: DescrRef,
        name: &str,
        ty: Type,
        immutable: bool,
        quasi_immutable: bool,
    ) -> DescrRef {
        let (owner_name, index, struct_immutable) = match &self.descrs[owner.0 as usize] {
            Descr::Size(s) => (s.name.clone(), s.fields.len(), s.immutable),
            _ => (String::new(), 0, false),
        };
        let full = format!("{}.{}", owner_name, name);
        let r = self.push(
            full.clone(),
            Descr::Field(FieldDescr {
                name: full,
                owner,
                index,
                ty,
                immutable: immutable || struct_immutable,
                quasi_immutable,
            }),
        );
        if let Descr::Size(s) = &mut self.descrs[owner.0 as usize] {
            s.fields.push(r);
        }
        r
    }

    /// Register an array of primitives
    pub fn add_array(&mut self, name: &str, item_ty: Type, item_size: i64, immutable: bool) -> DescrRef {
        self.push(
            name.to_string(),
            Descr::Array(ArrayDescr {
                name: name.to_string(),
                item_ty,
                item_size,
                interior: Vec::new(),
                immutable,
            }),
        )
    }

    /// Register an interior field of an array of structs; its name is `Array.field`
    pub fn add_interior_field(&mut self, array: DescrRef, name: &str, ty: Type) -> DescrRef {
        let (array_name, index) = match &self.descrs[array.0 as usize] {
            Descr::Array(a) => (a.name.clone(), a.interior.len()),
            _ => (String::new(), 0),
        };
        let full = format!("{}.{}", array_name, name);
        let r = self.push(
            full.clone(),
            Descr::InteriorField(InteriorFieldDescr {
                name: full,
                array,
                index,
                ty,
            }),
        );
        if let Descr::Array(a) = &mut self.descrs[array.0 as usize] {
            a.interior.push(r);
        }
        r
    }

    /// Register a call signature
    pub fn add_call(&mut self, call: CallDescr) -> DescrRef {
        let name = call.name.clone();
        self.push(name, Descr::Call(call))
    }

    /// Register a prebuilt constant object and return its id
    pub fn add_object(&mut self, name: &str, size: DescrRef) -> u32 {
        self.objects.push((name.to_string(), size));
        (self.objects.len() - 1) as u32
    }

    /// Prebuilt objects, indexed by id
    pub fn objects(&self) -> &[(String, DescrRef)] {
        &self.objects
    }

    pub fn object_by_name(&self, name: &str) -> Option<u32> {
        self.objects
            .iter()
            .position(|(n, _)| n == name)
            .map(|i| i as u32)
    }

    pub fn get(&self, r: DescrRef) -> Option<&Descr> {
        self.descrs.get(r.0 as usize)
    }

    pub fn lookup(&self, name: &str) -> Option<DescrRef> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.descrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descrs.is_empty()
    }

    pub fn name(&self, r: DescrRef) -> &str {
        match self.get(r) {
            Some(Descr::Size(d)) => &d.name,
            Some(Descr::Field(d)) => &d.name,
            Some(Descr::Array(d)) => &d.name,
            Some(Descr::InteriorField(d)) => &d.name,
            Some(Descr::Call(d)) => &d.name,
            None => "?",
        }
    }

    pub fn size(&self, r: DescrRef) -> Option<&SizeDescr> {
        match self.get(r) {
            Some(Descr::Size(d)) => Some(d),
            _ => None,
        }
    }

    pub fn field(&self, r: DescrRef) -> Option<&FieldDescr> {
        match self.get(r) {
            Some(Descr::Field(d)) => Some(d),
            _ => None,
        }
    }

    pub fn array(&self, r: DescrRef) -> Option<&ArrayDescr> {
        match self.get(r) {
            Some(Descr::Array(d)) => Some(d),
            _ => None,
        }
    }

    pub fn interior(&self, r: DescrRef) -> Option<&InteriorFieldDescr> {
        match self.get(r) {
            Some(Descr::InteriorField(d)) => Some(d),
            _ => None,
        }
    }

    pub fn call(&self, r: DescrRef) -> Option<&CallDescr> {
        match self.get(r) {
            Some(Descr::Call(d)) => Some(d),
            _ => None,
        }
    }

    /// Effect summary of a call descriptor
    pub fn effect(&self, r: DescrRef) -> Option<&EffectInfo> {
        self.call(r).map(|c| &c.effect)
    }

    /// Call descriptor of a builtin helper
    pub fn helper(&self, spec: OopSpec) -> Option<DescrRef> {
        self.helpers.get(&spec).copied()
    }

    pub fn vref(&self) -> VrefDescrs {
        self.vref
    }

    /// Whether reads of this field or array never change
    pub fn is_always_pure(&self, r: DescrRef) -> bool {
        match self.get(r) {
            Some(Descr::Field(f)) => f.immutable,
            Some(Descr::Array(a)) => a.immutable,
            _ => false,
        }
    }

    /// Struct layout whose vtable is the given class
    pub fn size_for_class(&self, class: i64) -> Option<DescrRef> {
        self.descrs.iter().enumerate().find_map(|(i, d)| match d {
            Descr::Size(s) if s.vtable == Some(class) => Some(DescrRef(i as u32)),
            _ => None,
        })
    }

    /// Iterate over all descriptors
    pub fn iter(&self) -> impl Iterator<Item = (DescrRef, &Descr)> {
        self.descrs
            .iter()
            .enumerate()
            .map(|(i, d)| (DescrRef(i as u32), d))
    }
}

impl Default for DescrTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DescrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "descr#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_fields() {
        let mut table = DescrTable::new();
        let node = table.add_struct("Node", Some(1), false);
        let value = table.add_field(node, "value", Type::Int, false);
        let next = table.add_field(node, "next", Type::Ref, false);

        assert_eq!(table.lookup("Node.value"), Some(value));
        assert_eq!(table.field(next).map(|f| f.index), Some(1));
        assert_eq!(table.size(node).map(|s| s.fields.clone()), Some(vec![value, next]));
        assert_eq!(table.size_for_class(1), Some(node));
    }

    #[test]
    fn test_builtin_helpers() {
        let table = DescrTable::new();
        let concat = table.helper(OopSpec::StrConcat(StrMode::Str));
        assert!(concat.is_some());
        let effect = concat.and_then(|d| table.effect(d)).map(|e| e.oopspec());
        assert_eq!(effect, Some(OopSpec::StrConcat(StrMode::Str)));
        assert!(table.lookup("uni_equal_lengthok").is_some());
        let vref = table.vref();
        assert_eq!(table.field(vref.forced).map(|f| f.ty), Some(Type::Ref));
    }

    #[test]
    fn test_oopspec_names() {
        for spec in [
            OopSpec::StrEqualSliceChar(StrMode::Unicode),
            OopSpec::DictLookup,
            OopSpec::ShrinkArray(StrMode::Str),
        ] {
            assert_eq!(OopSpec::from_name(&spec.name()), Some(spec));
        }
        assert_eq!(OopSpec::from_name("bogus"), None);
    }

    #[test]
    fn test_effect_queries() {
        let mut table = DescrTable::new();
        let s = table.add_struct("S", None, false);
        let f = table.add_field(s, "f", Type::Int, false);
        let g = table.add_field(s, "g", Type::Int, true);
        let effect = EffectInfo {
            write_fields: vec![f],
            ..EffectInfo::default()
        };
        assert!(effect.writes_field(f));
        assert!(!effect.writes_field(g));
        assert!(table.is_always_pure(g));
        let random = EffectInfo {
            flags: EffectFlags::RANDOM_EFFECTS,
            ..EffectInfo::default()
        };
        assert!(random.writes_field(g));
        assert!(random.can_invalidate());
    }
}
