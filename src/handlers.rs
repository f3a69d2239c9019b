//! Server-invokable method registry.
//!
//! Method names are matched case-insensitively: registration and lookup
//! both normalize to lowercase. Every callback registered for a name runs,
//! in registration order, on each matching invocation. Entries persist for
//! the life of the connection object; there is no unregistration.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::Value;

/// Callback invoked with an invocation's positional arguments.
pub type MethodHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Case-normalized mapping from method name to registered callbacks.
#[derive(Default)]
pub struct HandlerRegistry {
    methods: RwLock<HashMap<String, Vec<MethodHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the callback list for `method`.
    pub fn on(&self, method: &str, handler: impl Fn(&[Value]) + Send + Sync + 'static) {
        let mut methods = self.methods.write().expect("methods lock poisoned");
        methods
            .entry(method.to_lowercase())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Invoke every handler registered for `target`, in registration order.
    ///
    /// Returns `false` when no handler is registered for the name. The
    /// handler list is cloned out of the lock before invocation, so a
    /// callback may safely register further handlers.
    pub fn dispatch(&self, target: &str, arguments: &[Value]) -> bool {
        let handlers: Option<Vec<MethodHandler>> = {
            let methods = self.methods.read().expect("methods lock poisoned");
            methods
                .get(&target.to_lowercase())
                .map(|list| list.iter().map(Arc::clone).collect())
        };

        match handlers {
            Some(handlers) => {
                for handler in &handlers {
                    handler(arguments);
                }
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.methods.read().expect("methods lock poisoned").len();
        f.debug_struct("HandlerRegistry")
            .field("methods", &count)
            .finish()
    }
}
