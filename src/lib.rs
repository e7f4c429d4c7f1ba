//! SWC plugin that rewrites `console.*` debug output.
//!
//! Every statement-position `console.<method>(...)` call is wrapped in an
//! `if (debug.enabled("<module label>")) { ... }` guard, or deleted outright
//! when the removal policy is active. Indirect invocations through `.call`,
//! `.apply`, and `.bind`, as well as bare method references and
//! monkey-patching assignments, are recognized and neutralized so that no
//! unguarded path to an instrumented method survives. A
//! `const debug = require('debug');` prologue is prepended to every file.
//!
//! The pass must be scheduled exactly once per file: re-running it on its own
//! output prepends a second prologue and wraps guards in guards.

use serde::Deserialize;
use thiserror::Error;

use swc_core::{
    common::{sync::Lrc, FileName, Mark, SourceMap, SyntaxContext, DUMMY_SP},
    ecma::{
        ast::*,
        atoms::Atom,
        parser::{parse_file_as_script, EsSyntax, Syntax},
        visit::{VisitMut, VisitMutWith},
    },
    plugin::{
        metadata::TransformPluginMetadataContextKind, plugin_transform,
        proxies::TransformPluginProgramMetadata,
    },
};

// -----------------------------------------------------------------------------
// Constants
// -----------------------------------------------------------------------------

/// The only ambient global this pass ever looks for.
const GLOBAL_CONSOLE: &str = "console";

/// Identifier the emitted guards call `enabled` on; the prologue must bind it.
const DEBUG_IDENT: &str = "debug";

pub const DEFAULT_PROLOGUE: &str = "const debug = require('debug');\n";

// -----------------------------------------------------------------------------
// Policy
// -----------------------------------------------------------------------------

/// What to do with one recognized occurrence in one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub module_label: String,
    pub should_remove: bool,
}

/// Maps an absolute file path to a policy decision. Resolved fresh on every
/// recognized occurrence, never cached, so resolution must stay cheap and
/// deterministic for a given path within one run.
pub enum PolicyResolver {
    Custom(Box<dyn Fn(&str) -> PolicyDecision>),
    RootPrefix { root_path: String, remove: bool },
}

impl std::fmt::Debug for PolicyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyResolver::Custom(_) => f.debug_tuple("Custom").field(&"<fn>").finish(),
            PolicyResolver::RootPrefix { root_path, remove } => f
                .debug_struct("RootPrefix")
                .field("root_path", root_path)
                .field("remove", remove)
                .finish(),
        }
    }
}

impl PolicyResolver {
    pub fn custom(resolve: impl Fn(&str) -> PolicyDecision + 'static) -> Self {
        PolicyResolver::Custom(Box::new(resolve))
    }

    /// Derives the module label by stripping `root_path` off the front of the
    /// file path. This is the only construction reachable from the wasm
    /// plugin config, since closures cannot cross the plugin boundary.
    pub fn root_prefix(root_path: impl Into<String>, remove: bool) -> Self {
        PolicyResolver::RootPrefix {
            root_path: root_path.into(),
            remove,
        }
    }

    pub fn resolve(&self, abs_file_path: &str) -> PolicyDecision {
        match self {
            PolicyResolver::Custom(resolve) => resolve(abs_file_path),
            PolicyResolver::RootPrefix { root_path, remove } => {
                let label = abs_file_path
                    .strip_prefix(root_path.as_str())
                    .unwrap_or(abs_file_path)
                    .trim_start_matches('/');
                PolicyDecision {
                    module_label: label.to_string(),
                    should_remove: *remove,
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Configuration
// -----------------------------------------------------------------------------

#[derive(Default)]
pub struct GuardOptions {
    /// Method names for which every access pattern is left untouched.
    pub exclude: Vec<String>,
    pub resolver: Option<PolicyResolver>,
    /// Source text of the statement prepended to each file. Must parse to one
    /// single statement. Defaults to [`DEFAULT_PROLOGUE`].
    pub prologue: Option<String>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("a policy resolver is required: supply a custom resolver or a rootPath")]
    MissingResolver,
    #[error("failed to parse the prologue: {0}")]
    PrologueParse(String),
    #[error("the prologue must contain one single statement, found {0}")]
    PrologueStatementCount(usize),
}

/// Immutable per-run configuration: exclusion list, policy resolver, and the
/// parsed prologue statement. Shared across files; see [`DebugGuard::file_pass`].
#[derive(Debug)]
pub struct DebugGuard {
    exclude: Vec<String>,
    resolver: PolicyResolver,
    prologue: Stmt,
}

impl DebugGuard {
    /// Validates the configuration up front. Both fatal error classes (a
    /// missing resolver, a prologue that is not one single statement) surface
    /// here, before any file is visited.
    pub fn new(options: GuardOptions) -> Result<Self, ConfigError> {
        let resolver = options.resolver.ok_or(ConfigError::MissingResolver)?;
        let text = options
            .prologue
            .unwrap_or_else(|| DEFAULT_PROLOGUE.to_string());
        let prologue = parse_prologue(&text)?;
        Ok(Self {
            exclude: options.exclude,
            resolver,
            prologue,
        })
    }

    /// Visitor for one file's tree. `unresolved_mark` is the mark the host's
    /// resolver put on identifiers that have no local binding.
    pub fn file_pass(&self, abs_file_path: impl Into<String>, unresolved_mark: Mark) -> GuardPass<'_> {
        GuardPass {
            guard: self,
            file_path: abs_file_path.into(),
            unresolved_ctxt: SyntaxContext::empty().apply_mark(unresolved_mark),
        }
    }
}

fn parse_prologue(text: &str) -> Result<Stmt, ConfigError> {
    let cm: Lrc<SourceMap> = Default::default();
    let fm = cm.new_source_file(Lrc::new(FileName::Anon), text.to_string());
    let mut errors = vec![];
    let script = parse_file_as_script(
        &fm,
        Syntax::Es(EsSyntax::default()),
        EsVersion::latest(),
        None,
        &mut errors,
    )
    .map_err(|err| ConfigError::PrologueParse(format!("{:?}", err.kind())))?;
    if let Some(err) = errors.into_iter().next() {
        return Err(ConfigError::PrologueParse(format!("{:?}", err.kind())));
    }
    let mut body = script.body;
    if body.len() != 1 {
        return Err(ConfigError::PrologueStatementCount(body.len()));
    }
    Ok(body.remove(0))
}

// -----------------------------------------------------------------------------
// Access classification
// -----------------------------------------------------------------------------

/// A recognized syntactic path to a method of the global `console`, carrying
/// the method name. Anything else passes through the transform untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleAccess {
    /// `console.<method>(...)`
    Direct(Atom),
    /// `console.<method>.call(...)` or `console.<method>.apply(...)`
    CallApply(Atom),
    /// `console.<method>.bind(...)`
    Bind(Atom),
    /// `console.<method>` read or written without being called; also covers an
    /// uncalled `console.<method>.call` / `.apply` reference.
    Property(Atom),
}

fn ident_prop(prop: &MemberProp) -> Option<&IdentName> {
    match prop {
        MemberProp::Ident(ident) => Some(ident),
        _ => None,
    }
}

// -----------------------------------------------------------------------------
// Replacement constructors
// -----------------------------------------------------------------------------

/// `if (debug.enabled("<label>")) { <stmt> }`
///
/// Guards are only ever built around statements; skipping evaluation of an
/// expression used for its value would change program semantics.
fn guard_statement(label: &str, stmt: Stmt) -> Stmt {
    let test = Expr::Call(CallExpr {
        span: DUMMY_SP,
        callee: Callee::Expr(Box::new(Expr::Member(MemberExpr {
            span: DUMMY_SP,
            obj: Box::new(Expr::Ident(Ident::new(
                DEBUG_IDENT.into(),
                DUMMY_SP,
                SyntaxContext::empty(),
            ))),
            prop: MemberProp::Ident(IdentName::new("enabled".into(), DUMMY_SP)),
        }))),
        args: vec![ExprOrSpread {
            spread: None,
            expr: Box::new(Expr::Lit(Lit::Str(Str {
                span: DUMMY_SP,
                value: label.into(),
                raw: None,
            }))),
        }],
        type_args: None,
        ctxt: SyntaxContext::empty(),
    });
    Stmt::If(IfStmt {
        span: DUMMY_SP,
        test: Box::new(test),
        cons: Box::new(Stmt::Block(BlockStmt {
            span: DUMMY_SP,
            ctxt: SyntaxContext::empty(),
            stmts: vec![stmt],
        })),
        alt: None,
    })
}

/// A `function() {}` literal: referentially a function, safe wherever the
/// original method reference could be called, stored, or passed.
fn noop_function() -> Expr {
    Expr::Fn(FnExpr {
        ident: None,
        function: Box::new(Function {
            params: vec![],
            decorators: vec![],
            span: DUMMY_SP,
            ctxt: SyntaxContext::empty(),
            body: Some(BlockStmt {
                span: DUMMY_SP,
                ctxt: SyntaxContext::empty(),
                stmts: vec![],
            }),
            is_generator: false,
            is_async: false,
            type_params: None,
            return_type: None,
        }),
    })
}

/// `void 0`, for calls whose value position is being vacated.
fn void_zero() -> Expr {
    Expr::Unary(UnaryExpr {
        span: DUMMY_SP,
        op: UnaryOp::Void,
        arg: Box::new(Expr::Lit(Lit::Num(Number {
            span: DUMMY_SP,
            value: 0.0,
            raw: None,
        }))),
    })
}

// -----------------------------------------------------------------------------
// The per-file pass
// -----------------------------------------------------------------------------

pub struct GuardPass<'a> {
    guard: &'a DebugGuard,
    file_path: String,
    unresolved_ctxt: SyntaxContext,
}

impl GuardPass<'_> {
    /// True iff the expression is the unshadowed ambient `console`: the
    /// identifier resolved to no local binding, so it carries the unresolved
    /// context. A local variable that happens to be named `console` does not.
    fn is_global_console(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Ident(ident) => {
                ident.sym.as_ref() == GLOBAL_CONSOLE && ident.ctxt == self.unresolved_ctxt
            }
            _ => false,
        }
    }

    fn is_excluded(&self, method: &IdentName) -> bool {
        self.guard.exclude.iter().any(|name| name == method.sym.as_ref())
    }

    /// Classifies a call's callee. A three-level `console.<m>.call/apply/bind`
    /// chain is consumed as one unit here; the inner `console.<m>` member is
    /// never offered for classification again.
    fn classify_callee(&self, call: &CallExpr) -> Option<ConsoleAccess> {
        let callee = match &call.callee {
            Callee::Expr(expr) => &**expr,
            _ => return None,
        };
        let member = match callee {
            Expr::Member(member) => member,
            _ => return None,
        };
        let prop = ident_prop(&member.prop)?;
        if self.is_global_console(&member.obj) {
            if self.is_excluded(prop) {
                return None;
            }
            return Some(ConsoleAccess::Direct(prop.sym.clone()));
        }
        if let Expr::Member(inner) = &*member.obj {
            if self.is_global_console(&inner.obj) {
                let method = ident_prop(&inner.prop)?;
                if self.is_excluded(method) {
                    return None;
                }
                return match prop.sym.as_ref() {
                    "call" | "apply" => Some(ConsoleAccess::CallApply(method.sym.clone())),
                    "bind" => Some(ConsoleAccess::Bind(method.sym.clone())),
                    _ => None,
                };
            }
        }
        None
    }

    /// Classifies a member expression that is not a call callee: a bare
    /// `console.<m>`, or an uncalled `console.<m>.call` / `.apply` reference.
    fn classify_member(&self, member: &MemberExpr) -> Option<ConsoleAccess> {
        let prop = ident_prop(&member.prop)?;
        if self.is_global_console(&member.obj) {
            if self.is_excluded(prop) {
                return None;
            }
            return Some(ConsoleAccess::Property(prop.sym.clone()));
        }
        if let Expr::Member(inner) = &*member.obj {
            if matches!(prop.sym.as_ref(), "call" | "apply") && self.is_global_console(&inner.obj) {
                let method = ident_prop(&inner.prop)?;
                if self.is_excluded(method) {
                    return None;
                }
                return Some(ConsoleAccess::Property(method.sym.clone()));
            }
        }
        None
    }

    fn decide(&self) -> PolicyDecision {
        self.guard.resolver.resolve(&self.file_path)
    }

    /// Descends into the object slot of an unmatched member expression. An
    /// inner `console.<m>` there belongs to a longer chain that did not match
    /// as a whole, so it must not be rewritten on its own.
    fn visit_member_obj(&mut self, obj: &mut Expr) {
        if let Expr::Member(member) = obj {
            if self.classify_member(member).is_some() {
                return;
            }
        }
        self.visit_mut_expr(obj);
    }
}

impl VisitMut for GuardPass<'_> {
    fn visit_mut_program(&mut self, program: &mut Program) {
        // Prologue first, once per file, whether or not anything matches below.
        let prologue = self.guard.prologue.clone();
        match program {
            Program::Module(module) => module.body.insert(0, ModuleItem::Stmt(prologue)),
            Program::Script(script) => script.body.insert(0, prologue),
        }
        program.visit_mut_children_with(self);
    }

    fn visit_mut_stmt(&mut self, stmt: &mut Stmt) {
        let matched = match stmt {
            Stmt::Expr(expr_stmt) => match &*expr_stmt.expr {
                Expr::Call(call) => matches!(
                    self.classify_callee(call),
                    Some(ConsoleAccess::Direct(_)) | Some(ConsoleAccess::CallApply(_))
                ),
                _ => false,
            },
            _ => false,
        };
        if !matched {
            stmt.visit_mut_children_with(self);
            return;
        }

        let decision = self.decide();
        if decision.should_remove {
            *stmt = Stmt::Empty(EmptyStmt { span: DUMMY_SP });
            return;
        }
        // Monkey-patching assignments hiding in the arguments still get
        // neutralized before the statement is wrapped.
        if let Stmt::Expr(expr_stmt) = stmt {
            if let Expr::Call(call) = &mut *expr_stmt.expr {
                call.args.visit_mut_with(self);
            }
        }
        let original = std::mem::replace(stmt, Stmt::Empty(EmptyStmt { span: DUMMY_SP }));
        *stmt = guard_statement(&decision.module_label, original);
    }

    fn visit_mut_stmts(&mut self, stmts: &mut Vec<Stmt>) {
        stmts.visit_mut_children_with(self);
        stmts.retain(|stmt| !matches!(stmt, Stmt::Empty(_)));
    }

    fn visit_mut_module_items(&mut self, items: &mut Vec<ModuleItem>) {
        items.visit_mut_children_with(self);
        items.retain(|item| !matches!(item, ModuleItem::Stmt(Stmt::Empty(_))));
    }

    fn visit_mut_expr(&mut self, expr: &mut Expr) {
        let access = match &*expr {
            Expr::Call(call) => self.classify_callee(call),
            Expr::Member(member) => self.classify_member(member),
            _ => None,
        };

        match access {
            // A call reached here is in expression position; its statement
            // form was already consumed by visit_mut_stmt.
            Some(ConsoleAccess::Direct(_)) | Some(ConsoleAccess::CallApply(_)) => {
                if self.decide().should_remove {
                    *expr = void_zero();
                } else if let Expr::Call(call) = expr {
                    call.args.visit_mut_with(self);
                }
            }
            Some(ConsoleAccess::Bind(_)) => {
                if self.decide().should_remove {
                    *expr = noop_function();
                }
            }
            Some(ConsoleAccess::Property(_)) => {
                if self.decide().should_remove {
                    *expr = noop_function();
                }
            }
            None => {
                if let Expr::Member(member) = expr {
                    if let MemberProp::Computed(prop) = &mut member.prop {
                        prop.expr.visit_mut_with(self);
                    }
                    self.visit_member_obj(&mut member.obj);
                } else {
                    expr.visit_mut_children_with(self);
                }
            }
        }
    }

    fn visit_mut_assign_expr(&mut self, assign: &mut AssignExpr) {
        if let AssignTarget::Simple(SimpleAssignTarget::Member(member)) = &assign.left {
            if self.classify_member(member).is_some() {
                // Writing over an instrumented method is neutralized under
                // every policy, regardless of the assignment operator.
                assign.right = Box::new(noop_function());
                return;
            }
        }
        assign.visit_mut_children_with(self);
    }

    fn visit_mut_simple_assign_target(&mut self, target: &mut SimpleAssignTarget) {
        // A target is a write slot, not a value; a `console.<m>` sitting here
        // must never be swapped for a function literal.
        match target {
            SimpleAssignTarget::Member(member) => {
                if let MemberProp::Computed(prop) = &mut member.prop {
                    prop.expr.visit_mut_with(self);
                }
                self.visit_member_obj(&mut member.obj);
            }
            SimpleAssignTarget::Paren(paren) => self.visit_member_obj(&mut paren.expr),
            _ => target.visit_mut_children_with(self),
        }
    }
}

// -----------------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------------

/// JSON shape of the plugin config block in the host compiler's settings.
#[derive(Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PluginConfig {
    exclude: Vec<String>,
    root_path: Option<String>,
    remove: bool,
    prologue: Option<String>,
}

#[plugin_transform]
pub fn process_transform(mut program: Program, metadata: TransformPluginProgramMetadata) -> Program {
    let config: PluginConfig = metadata
        .get_transform_plugin_config()
        .map(|s| serde_json::from_str(&s).unwrap_or_default())
        .unwrap_or_default();

    let remove = config.remove;
    let guard = DebugGuard::new(GuardOptions {
        exclude: config.exclude,
        resolver: config
            .root_path
            .map(|root| PolicyResolver::root_prefix(root, remove)),
        prologue: config.prologue,
    })
    .unwrap_or_else(|err| panic!("debug_guard_swc_plugin: {err}"));

    let file_path = metadata
        .get_context(&TransformPluginMetadataContextKind::Filename)
        .unwrap_or_else(|| "unknown".to_string());

    let mut pass = guard.file_pass(file_path, metadata.unresolved_mark);
    program.visit_mut_with(&mut pass);
    program
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
