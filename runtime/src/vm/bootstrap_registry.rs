use crate::error::JvmError;
use crate::keys::{ClassId, FieldKey, MethodKey, Symbol};
use bonsai_classfile::descriptor::PrimitiveType;
use lasso::ThreadedRodeo;
use once_cell::sync::OnceCell;

/// Pre-interned names, descriptors and well-known class ids the runtime
/// keeps reaching for. Built once before any class is loaded.
pub struct BootstrapRegistry {
    // Common method keys
    pub clinit_mk: MethodKey,
    pub no_arg_constructor_mk: MethodKey,
    pub string_constructor_mk: MethodKey,
    pub main_mk: MethodKey,
    pub run_mk: MethodKey,
    pub finalize_mk: MethodKey,

    // Common field keys
    pub reference_referent_fk: FieldKey,
    pub reference_queue_fk: FieldKey,
    pub reference_next_fk: FieldKey,
    pub queue_head_fk: FieldKey,
    pub string_value_fk: FieldKey,
    pub string_coder_fk: FieldKey,
    pub thread_daemon_fk: FieldKey,
    pub thread_name_fk: FieldKey,

    // Common class names (interned)
    pub java_lang_object_sym: Symbol,
    pub java_lang_class_sym: Symbol,
    pub java_lang_class_loader_sym: Symbol,
    pub java_lang_throwable_sym: Symbol,
    pub java_lang_error_sym: Symbol,
    pub java_lang_string_sym: Symbol,
    pub java_lang_system_sym: Symbol,
    pub java_lang_thread_sym: Symbol,
    pub java_lang_ref_reference_sym: Symbol,
    pub java_lang_ref_soft_sym: Symbol,
    pub java_lang_ref_weak_sym: Symbol,
    pub java_lang_ref_phantom_sym: Symbol,
    pub java_lang_ref_queue_sym: Symbol,

    // Primitive name symbols
    pub int_sym: Symbol,
    pub byte_sym: Symbol,
    pub short_sym: Symbol,
    pub long_sym: Symbol,
    pub float_sym: Symbol,
    pub double_sym: Symbol,
    pub char_sym: Symbol,
    pub boolean_sym: Symbol,
    pub void_sym: Symbol,

    // Common method names (interned)
    pub init_sym: Symbol,
    pub clinit_sym: Symbol,
    pub main_sym: Symbol,
    pub clone_sym: Symbol,
    pub finalize_sym: Symbol,

    // Common descriptors (interned)
    pub void_desc: Symbol,
    pub string_desc: Symbol,
    pub object_desc: Symbol,
    pub byte_array_desc: Symbol,
    pub char_array_desc: Symbol,
    pub clone_desc: Symbol,
    pub reference_queue_desc: Symbol,

    // Core class ids, set as the bootstrap sequence loads them
    java_lang_object_id: OnceCell<ClassId>,
    java_lang_class_id: OnceCell<ClassId>,
    java_lang_throwable_id: OnceCell<ClassId>,
    java_lang_string_id: OnceCell<ClassId>,
    java_lang_thread_id: OnceCell<ClassId>,
    byte_array_class_id: OnceCell<ClassId>,
}

impl BootstrapRegistry {
    pub fn new(interner: &ThreadedRodeo) -> Self {
        let clinit_sym = interner.get_or_intern("<clinit>");
        let init_sym = interner.get_or_intern("<init>");
        let main_sym = interner.get_or_intern("main");
        let finalize_sym = interner.get_or_intern("finalize");

        let void_desc = interner.get_or_intern("()V");
        let string_desc = interner.get_or_intern("Ljava/lang/String;");
        let object_desc = interner.get_or_intern("Ljava/lang/Object;");
        let byte_array_desc = interner.get_or_intern("[B");
        let char_array_desc = interner.get_or_intern("[C");
        let byte_desc = interner.get_or_intern("B");
        let boolean_desc = interner.get_or_intern("Z");
        let reference_queue_desc = interner.get_or_intern("Ljava/lang/ref/ReferenceQueue;");

        Self {
            clinit_mk: MethodKey {
                name: clinit_sym,
                desc: void_desc,
            },
            no_arg_constructor_mk: MethodKey {
                name: init_sym,
                desc: void_desc,
            },
            string_constructor_mk: MethodKey {
                name: init_sym,
                desc: interner.get_or_intern("(Ljava/lang/String;)V"),
            },
            main_mk: MethodKey {
                name: main_sym,
                desc: interner.get_or_intern("([Ljava/lang/String;)V"),
            },
            run_mk: MethodKey {
                name: interner.get_or_intern("run"),
                desc: void_desc,
            },
            finalize_mk: MethodKey {
                name: finalize_sym,
                desc: void_desc,
            },

            reference_referent_fk: FieldKey {
                name: interner.get_or_intern("referent"),
                desc: object_desc,
            },
            reference_queue_fk: FieldKey {
                name: interner.get_or_intern("queue"),
                desc: reference_queue_desc,
            },
            reference_next_fk: FieldKey {
                name: interner.get_or_intern("next"),
                desc: interner.get_or_intern("Ljava/lang/ref/Reference;"),
            },
            queue_head_fk: FieldKey {
                name: interner.get_or_intern("head"),
                desc: interner.get_or_intern("Ljava/lang/ref/Reference;"),
            },
            string_value_fk: FieldKey {
                name: interner.get_or_intern("value"),
                desc: byte_array_desc,
            },
            string_coder_fk: FieldKey {
                name: interner.get_or_intern("coder"),
                desc: byte_desc,
            },
            thread_daemon_fk: FieldKey {
                name: interner.get_or_intern("daemon"),
                desc: boolean_desc,
            },
            thread_name_fk: FieldKey {
                name: interner.get_or_intern("name"),
                desc: string_desc,
            },

            java_lang_object_sym: interner.get_or_intern("java/lang/Object"),
            java_lang_class_sym: interner.get_or_intern("java/lang/Class"),
            java_lang_class_loader_sym: interner.get_or_intern("java/lang/ClassLoader"),
            java_lang_throwable_sym: interner.get_or_intern("java/lang/Throwable"),
            java_lang_error_sym: interner.get_or_intern("java/lang/Error"),
            java_lang_string_sym: interner.get_or_intern("java/lang/String"),
            java_lang_system_sym: interner.get_or_intern("java/lang/System"),
            java_lang_thread_sym: interner.get_or_intern("java/lang/Thread"),
            java_lang_ref_reference_sym: interner.get_or_intern("java/lang/ref/Reference"),
            java_lang_ref_soft_sym: interner.get_or_intern("java/lang/ref/SoftReference"),
            java_lang_ref_weak_sym: interner.get_or_intern("java/lang/ref/WeakReference"),
            java_lang_ref_phantom_sym: interner.get_or_intern("java/lang/ref/PhantomReference"),
            java_lang_ref_queue_sym: interner.get_or_intern("java/lang/ref/ReferenceQueue"),

            int_sym: interner.get_or_intern("int"),
            byte_sym: interner.get_or_intern("byte"),
            short_sym: interner.get_or_intern("short"),
            long_sym: interner.get_or_intern("long"),
            float_sym: interner.get_or_intern("float"),
            double_sym: interner.get_or_intern("double"),
            char_sym: interner.get_or_intern("char"),
            boolean_sym: interner.get_or_intern("boolean"),
            void_sym: interner.get_or_intern("void"),

            init_sym,
            clinit_sym,
            main_sym,
            clone_sym: interner.get_or_intern("clone"),
            finalize_sym,

            void_desc,
            string_desc,
            object_desc,
            byte_array_desc,
            char_array_desc,
            clone_desc: interner.get_or_intern("()Ljava/lang/Object;"),
            reference_queue_desc,

            java_lang_object_id: OnceCell::new(),
            java_lang_class_id: OnceCell::new(),
            java_lang_throwable_id: OnceCell::new(),
            java_lang_string_id: OnceCell::new(),
            java_lang_thread_id: OnceCell::new(),
            byte_array_class_id: OnceCell::new(),
        }
    }

    pub fn get_primitive_sym(&self, primitive: PrimitiveType) -> Symbol {
        match primitive {
            PrimitiveType::Int => self.int_sym,
            PrimitiveType::Byte => self.byte_sym,
            PrimitiveType::Short => self.short_sym,
            PrimitiveType::Long => self.long_sym,
            PrimitiveType::Float => self.float_sym,
            PrimitiveType::Double => self.double_sym,
            PrimitiveType::Char => self.char_sym,
            PrimitiveType::Boolean => self.boolean_sym,
        }
    }
}

macro_rules! core_class_id {
    ($set:ident, $get:ident, $cell:ident, $what:literal) => {
        impl BootstrapRegistry {
            pub fn $set(&self, class_id: ClassId) -> Result<(), JvmError> {
                self.$cell.set(class_id).map_err(|_| {
                    JvmError::IllegalInternalState(concat!($what, " id already set").to_string())
                })
            }

            pub fn $get(&self) -> Result<ClassId, JvmError> {
                self.$cell.get().copied().ok_or_else(|| {
                    JvmError::IllegalInternalState(concat!($what, " is not loaded").to_string())
                })
            }
        }
    };
}

core_class_id!(
    set_java_lang_object_id,
    get_java_lang_object_id,
    java_lang_object_id,
    "java/lang/Object"
);
core_class_id!(
    set_java_lang_class_id,
    get_java_lang_class_id,
    java_lang_class_id,
    "java/lang/Class"
);
core_class_id!(
    set_java_lang_throwable_id,
    get_java_lang_throwable_id,
    java_lang_throwable_id,
    "java/lang/Throwable"
);
core_class_id!(
    set_java_lang_string_id,
    get_java_lang_string_id,
    java_lang_string_id,
    "java/lang/String"
);
core_class_id!(
    set_java_lang_thread_id,
    get_java_lang_thread_id,
    java_lang_thread_id,
    "java/lang/Thread"
);
core_class_id!(
    set_byte_array_class_id,
    get_byte_array_class_id,
    byte_array_class_id,
    "[B"
);
