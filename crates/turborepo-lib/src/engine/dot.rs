use std::fmt::Write;

use itertools::Itertools;

use super::{Built, Engine};

impl Engine<Built> {
    /// Renders the task graph in graphviz dot form, edges pointing from
    /// dependent to dependency. Output is sorted so identical graphs render
    /// identically.
    pub fn dot_graph(&self) -> String {
        let mut out = String::new();
        out.push_str("digraph {\n");
        out.push_str("\tcompound = \"true\"\n");
        out.push_str("\tnewrank = \"true\"\n");

        let edges = self
            .task_graph
            .edge_indices()
            .filter_map(|edge| self.task_graph.edge_endpoints(edge))
            .map(|(src, dst)| {
                let src = &self.task_graph[src];
                let dst = &self.task_graph[dst];
                format!("\t\"[root] {src}\" -> \"[root] {dst}\"")
            })
            .sorted();
        for edge in edges {
            let _ = writeln!(out, "{edge}");
        }

        out.push_str("}\n");
        out
    }
}
